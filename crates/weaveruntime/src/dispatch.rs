use crate::registry::{ExecutorRegistry, StepExecutor, StepInvocation};
use crate::tracker::RunTracker;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use weavecore::{
    RetryPolicy, RunId, StepError, StepStatus, Value, Workflow, WorkflowContext, WorkflowStep,
};

/// Terminal result of dispatching one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(Value),
    Failed { error: StepError, attempts: u32 },
    Cancelled,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded(_))
    }
}

/// Runs single steps of one run: input resolution, attempts, backoff,
/// timeouts, output publication and state tracking.
pub struct Dispatcher {
    run_id: RunId,
    workflow: Arc<Workflow>,
    registry: Arc<ExecutorRegistry>,
    tracker: Arc<RunTracker>,
    default_timeout_ms: Option<u64>,
}

impl Dispatcher {
    pub fn new(
        run_id: RunId,
        workflow: Arc<Workflow>,
        registry: Arc<ExecutorRegistry>,
        tracker: Arc<RunTracker>,
        default_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            run_id,
            workflow,
            registry,
            tracker,
            default_timeout_ms,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    fn retry_policy(&self, step: &WorkflowStep) -> RetryPolicy {
        step.retry
            .clone()
            .or_else(|| self.workflow.settings.default_retry.clone())
            .unwrap_or_else(RetryPolicy::none)
    }

    fn timeout_ms(&self, step: &WorkflowStep) -> Option<u64> {
        step.timeout_ms
            .or(self.workflow.settings.default_timeout_ms)
            .or(self.default_timeout_ms)
    }

    /// Drive a step to a terminal outcome. Boxed so that executors for
    /// Parallel and Loop can call back into it for nested steps.
    pub fn run_step<'a>(
        &'a self,
        step_id: &'a str,
        context: &'a WorkflowContext,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, StepOutcome> {
        Box::pin(async move {
            let outcome = self.attempts(step_id, context, cancel).await;
            self.close_nested(step_id, &outcome).await;
            outcome
        })
    }

    /// Nested steps the owner never reached take a status from its outcome
    async fn close_nested(&self, step_id: &str, outcome: &StepOutcome) {
        let nested = self.workflow.descendants(step_id);
        if nested.is_empty() {
            return;
        }
        let (status, reason) = match outcome {
            StepOutcome::Succeeded(_) => (StepStatus::Skipped, "owner produced no iterations"),
            StepOutcome::Failed { .. } => (StepStatus::Skipped, "owner failed before running it"),
            StepOutcome::Cancelled => (StepStatus::Cancelled, "owner cancelled"),
        };
        self.tracker.settle_nested(&nested, status, reason).await;
    }

    /// Record a step whose `when` guard could not be evaluated
    pub async fn guard_failed(&self, step_id: &str, error: StepError) -> StepOutcome {
        error!(run_id = %self.run_id, step_id, "Step guard failed: {}", error);
        self.tracker.step_failed(step_id, 0, &error, true).await;
        let outcome = StepOutcome::Failed { error, attempts: 0 };
        self.close_nested(step_id, &outcome).await;
        outcome
    }

    async fn attempts(
        &self,
        step_id: &str,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let Some(step) = self.workflow.find_step(step_id) else {
            return StepOutcome::Failed {
                error: StepError::execution(format!("unknown step '{}'", step_id)),
                attempts: 0,
            };
        };
        let Some(executor) = self.registry.get(step.kind.tag()) else {
            return StepOutcome::Failed {
                error: StepError::execution(format!(
                    "no executor registered for kind '{}'",
                    step.kind.tag()
                )),
                attempts: 0,
            };
        };

        let policy = self.retry_policy(step);
        let max_attempts = policy.attempts();
        let timeout_ms = self.timeout_ms(step);
        let record = !context.is_scoped();
        let nested = self.workflow.descendants(step_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return self.cancelled(step_id, "run cancelled before start").await;
            }

            self.tracker.step_started(step_id, attempt).await;
            self.tracker.reset_nested(&nested).await;
            info!(run_id = %self.run_id, step_id, attempt, kind = %step.kind.tag(), "Step started");

            let result = self
                .attempt(step, executor.as_ref(), context, cancel, timeout_ms, attempt)
                .await;
            if matches!(result, Err(StepError::Timeout { .. })) {
                // The owner's future was dropped along with its children
                self.tracker.interrupt_nested(&nested, "owner timed out").await;
            }
            let result = result.and_then(|output| {
                context
                    .publish(step_id, output.clone())
                    .map(|_| output)
                    .map_err(|e| StepError::execution(e.to_string()))
            });

            match result {
                Ok(output) => {
                    info!(run_id = %self.run_id, step_id, attempt, "Step succeeded");
                    self.tracker
                        .step_succeeded(step_id, attempt, record.then(|| output.clone()))
                        .await;
                    return StepOutcome::Succeeded(output);
                }
                Err(StepError::Cancelled) => {
                    return self.cancelled(step_id, "cancelled while running").await;
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        run_id = %self.run_id,
                        step_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Step attempt failed, retrying: {}",
                        err
                    );
                    self.tracker.step_retried(step_id, attempt, &err).await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return self.cancelled(step_id, "cancelled during retry backoff").await;
                        }
                    }
                }
                Err(err) => {
                    error!(run_id = %self.run_id, step_id, attempt, "Step failed: {}", err);
                    self.tracker
                        .step_failed(step_id, attempt, &err, record)
                        .await;
                    return StepOutcome::Failed {
                        error: err,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn attempt(
        &self,
        step: &WorkflowStep,
        executor: &dyn StepExecutor,
        context: &WorkflowContext,
        cancel: &CancellationToken,
        timeout_ms: Option<u64>,
        attempt: u32,
    ) -> Result<Value, StepError> {
        let inputs = context.resolve_inputs(&step.inputs)?;
        debug!(run_id = %self.run_id, step_id = %step.id, inputs = inputs.len(), "Inputs resolved");

        let invocation = StepInvocation {
            step,
            inputs,
            context,
            cancel,
            attempt,
            dispatcher: self,
        };
        let running = executor.execute(invocation);

        match timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), running)
                .await
                .map_err(|_| StepError::Timeout { ms })?,
            None => running.await,
        }
    }

    async fn cancelled(&self, step_id: &str, reason: &str) -> StepOutcome {
        info!(run_id = %self.run_id, step_id, "Step cancelled: {}", reason);
        self.tracker.step_cancelled(step_id, reason).await;
        StepOutcome::Cancelled
    }
}

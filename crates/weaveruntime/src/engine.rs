use crate::dispatch::{Dispatcher, StepOutcome};
use crate::registry::ExecutorRegistry;
use crate::resolver::{resolve, ExecutionPlan};
use crate::runtime::RuntimeConfig;
use crate::tracker::RunTracker;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;
use weavecore::{
    Expression, FailurePolicy, HookBus, Reference, RunFailure, RunId, StepError, StepId,
    StepKind, StepKindTag, StepStatus, ValidationError, Value, Workflow, WorkflowContext,
    WorkflowState, WorkflowStatus, WorkflowStep,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("no executor registered for kind '{kind}' used by step '{step}'")]
    UnsupportedKind { step: StepId, kind: StepKindTag },

    #[error("step '{step}' failed after {attempts} attempt(s): {source}")]
    RetryExhausted {
        step: StepId,
        attempts: u32,
        #[source]
        source: StepError,
    },

    #[error("run {run_id} was cancelled")]
    WorkflowCancelled { run_id: RunId, step: Option<StepId> },

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("run task failed: {0}")]
    Join(String),
}

/// Final state of a run plus every top-level output
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: WorkflowState,
    pub outputs: BTreeMap<StepId, Value>,
}

impl RunReport {
    pub fn run_id(&self) -> RunId {
        self.state.run_id
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.status
    }

    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs.get(step)
    }

    pub fn step_status(&self, step: &str) -> StepStatus {
        self.state.status_of(step)
    }

    /// `Ok` for a succeeded run, otherwise the error that ended it
    pub fn into_result(self) -> Result<Self, EngineError> {
        match self.state.status {
            WorkflowStatus::Succeeded => Ok(self),
            WorkflowStatus::Cancelled => Err(EngineError::WorkflowCancelled {
                run_id: self.state.run_id,
                step: self.state.failure.and_then(|f| f.step_id),
            }),
            _ => {
                let failure = self.state.failure.clone();
                let step = failure
                    .as_ref()
                    .and_then(|f| f.step_id.clone())
                    .unwrap_or_default();
                let (attempts, source) = match self.state.steps.get(&step) {
                    Some(s) => (
                        s.attempts,
                        s.last_error
                            .clone()
                            .unwrap_or_else(|| StepError::execution("unknown failure")),
                    ),
                    None => (
                        0,
                        StepError::execution(
                            failure.map(|f| f.message).unwrap_or_else(|| "run failed".into()),
                        ),
                    ),
                };
                Err(EngineError::RetryExhausted {
                    step,
                    attempts,
                    source,
                })
            }
        }
    }
}

/// How a top-level step settled, as far as its dependents are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    /// Succeeded, or failed with `continue_on_failure`
    Succeeded,
    /// Failed, cancelled, or skipped because of an upstream failure
    Blocked,
    /// Skipped because a condition did not select it
    Pruned,
}

enum Readiness {
    Ready,
    Wait,
    Skip(Settled, &'static str),
}

/// Executes workflows as DAGs with bounded parallelism
pub struct WorkflowEngine {
    registry: Arc<ExecutorRegistry>,
    hooks: HookBus,
    config: RuntimeConfig,
}

impl WorkflowEngine {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: ExecutorRegistry, config: RuntimeConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            hooks: HookBus::new(config.event_buffer_size),
            config,
        }
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    pub fn hooks(&self) -> &HookBus {
        &self.hooks
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Resolve the plan and check that every kind in use has an executor
    pub fn validate(&self, workflow: &Workflow) -> Result<ExecutionPlan, EngineError> {
        let plan = resolve(workflow)?;
        for step in &workflow.steps {
            let kind = step.kind.tag();
            if !self.registry.contains(kind) {
                return Err(EngineError::UnsupportedKind {
                    step: step.id.clone(),
                    kind,
                });
            }
        }
        Ok(plan)
    }

    /// Run a workflow to completion
    pub async fn run(&self, workflow: Arc<Workflow>, inputs: Value) -> Result<RunReport, EngineError> {
        self.execute(workflow, inputs, Uuid::new_v4(), CancellationToken::new())
            .await
    }

    /// Run a workflow under a caller-chosen run id and cancellation token.
    ///
    /// Validation failures are returned as `Err` before any step runs. Step
    /// failures do not make this return `Err`; they are reported in the
    /// run state (see [`RunReport::into_result`]).
    pub async fn execute(
        &self,
        workflow: Arc<Workflow>,
        inputs: Value,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Result<RunReport, EngineError> {
        self.validate(&workflow)?;

        let step_ids: Vec<&StepId> = workflow.steps.iter().map(|s| &s.id).collect();
        let mut state = WorkflowState::new(workflow.id.clone(), step_ids);
        state.run_id = run_id;
        let tracker = Arc::new(RunTracker::new(state, self.hooks.clone()));
        let context = WorkflowContext::new(inputs);
        let dispatcher = Arc::new(Dispatcher::new(
            run_id,
            Arc::clone(&workflow),
            Arc::clone(&self.registry),
            Arc::clone(&tracker),
            self.config.default_step_timeout_ms,
        ));

        info!(run_id = %run_id, workflow = %workflow.name, "Starting workflow execution");
        tracker.workflow_started().await;

        let (status, failure) = self
            .drive(&workflow, &dispatcher, &tracker, &context, &cancel)
            .await;

        match status {
            WorkflowStatus::Succeeded => info!(run_id = %run_id, "Workflow succeeded"),
            WorkflowStatus::Cancelled => info!(run_id = %run_id, "Workflow cancelled"),
            _ => error!(
                run_id = %run_id,
                "Workflow failed: {}",
                failure.as_ref().map(|f| f.message.as_str()).unwrap_or("unknown")
            ),
        }
        tracker.workflow_completed(status, failure).await;

        Ok(RunReport {
            state: tracker.snapshot().await,
            outputs: context.snapshot(),
        })
    }

    /// Schedule top-level steps until every one of them is terminal
    async fn drive(
        &self,
        workflow: &Workflow,
        dispatcher: &Arc<Dispatcher>,
        tracker: &RunTracker,
        context: &WorkflowContext,
        cancel: &CancellationToken,
    ) -> (WorkflowStatus, Option<RunFailure>) {
        let top_level = workflow.top_level_steps();
        let max_parallel = workflow
            .settings
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let fail_fast =
            workflow.settings.failure_policy == FailurePolicy::FailFast || self.config.fail_fast;

        let mut settled: HashMap<&str, Settled> = HashMap::new();
        let mut started: HashSet<&str> = HashSet::new();
        let mut running = FuturesUnordered::new();
        let mut first_failure: Option<RunFailure> = None;
        let mut halted = false;
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.is_cancelled() {
                cancelled = true;
                for step in &top_level {
                    if !started.contains(step.id.as_str()) && !settled.contains_key(step.id.as_str()) {
                        settled.insert(step.id.as_str(), Settled::Blocked);
                        let reason = "run cancelled before start";
                        tracker.step_cancelled(&step.id, reason).await;
                        let nested = workflow.descendants(&step.id);
                        tracker.settle_nested(&nested, StepStatus::Cancelled, reason).await;
                    }
                }
            }

            if !cancelled && !halted {
                // Skips can unblock or skip later steps, so settle to a fixpoint
                let mut progress = true;
                while progress {
                    progress = false;
                    for step in &top_level {
                        let id = step.id.as_str();
                        if started.contains(id) || settled.contains_key(id) {
                            continue;
                        }
                        match readiness(step, &settled) {
                            Readiness::Wait => {}
                            Readiness::Skip(how, reason) => {
                                debug!(step_id = id, "Skipping step: {}", reason);
                                settled.insert(id, how);
                                skip_step(workflow, tracker, id, reason).await;
                                progress = true;
                            }
                            Readiness::Ready => match guard(step, context) {
                                Some(Ok(false)) => {
                                    debug!(step_id = id, "Skipping step: guard false");
                                    settled.insert(id, Settled::Pruned);
                                    skip_step(workflow, tracker, id, "guard false").await;
                                    progress = true;
                                }
                                _ if running.len() >= max_parallel => {}
                                checked => {
                                    debug!(step_id = id, in_flight = running.len(), "Dispatching step");
                                    started.insert(id);
                                    let guard_error = checked.and_then(Result::err);
                                    let dispatcher = Arc::clone(dispatcher);
                                    let context = context.clone();
                                    let token = cancel.child_token();
                                    let step_id = step.id.clone();
                                    let handle = tokio::spawn(async move {
                                        match guard_error {
                                            Some(error) => dispatcher.guard_failed(&step_id, error).await,
                                            None => dispatcher.run_step(&step_id, &context, &token).await,
                                        }
                                    });
                                    let step_id = step.id.clone();
                                    running.push(async move { (step_id, handle.await) });
                                }
                            },
                        }
                    }
                }
            }

            // If nothing is running and nothing is ready, we're done
            if running.is_empty() {
                break;
            }

            let completed = tokio::select! {
                next = running.next() => next,
                _ = cancel.cancelled(), if !cancelled => continue,
            };
            let Some((step_id, joined)) = completed else {
                break;
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = StepError::execution(format!("step task aborted: {}", e));
                    tracker.step_failed(&step_id, 1, &error, true).await;
                    StepOutcome::Failed { error, attempts: 1 }
                }
            };

            let Some(step) = workflow.find_step(&step_id) else {
                continue;
            };
            let id = step.id.as_str();
            started.remove(id);

            match outcome {
                StepOutcome::Succeeded(output) => {
                    settled.insert(id, Settled::Succeeded);
                    if let StepKind::Condition { then, otherwise, .. } = &step.kind {
                        let untaken = if output.as_bool().unwrap_or(false) {
                            otherwise
                        } else {
                            then
                        };
                        let untaken: Vec<&StepId> = untaken.iter().collect();
                        prune(workflow, tracker, &mut settled, untaken, "condition branch not taken")
                            .await;
                    }
                }
                StepOutcome::Failed { .. } if step.continue_on_failure => {
                    // Dependents still run; references to the missing output fail on their own
                    settled.insert(id, Settled::Succeeded);
                    if let StepKind::Condition { then, otherwise, .. } = &step.kind {
                        let branches: Vec<&StepId> = then.iter().chain(otherwise.iter()).collect();
                        prune(workflow, tracker, &mut settled, branches, "condition did not evaluate")
                            .await;
                    }
                }
                StepOutcome::Failed { error, .. } => {
                    settled.insert(id, Settled::Blocked);
                    if first_failure.is_none() {
                        first_failure = Some(RunFailure::from_step(id, &error));
                    }
                    if fail_fast && !halted {
                        halted = true;
                        for other in &top_level {
                            let other_id = other.id.as_str();
                            if !started.contains(other_id) && !settled.contains_key(other_id) {
                                settled.insert(other_id, Settled::Blocked);
                                skip_step(workflow, tracker, other_id, "fail fast").await;
                            }
                        }
                    }
                }
                StepOutcome::Cancelled => {
                    settled.insert(id, Settled::Blocked);
                }
            }
        }

        if cancelled {
            let step = tracker
                .snapshot()
                .await
                .steps
                .iter()
                .find(|(_, s)| s.status == StepStatus::Cancelled)
                .map(|(id, _)| id.clone());
            let failure = RunFailure {
                step_id: step,
                message: "run cancelled".to_string(),
                chain: Vec::new(),
            };
            return (WorkflowStatus::Cancelled, Some(failure));
        }
        match first_failure {
            Some(failure) => (WorkflowStatus::Failed, Some(failure)),
            None => (WorkflowStatus::Succeeded, None),
        }
    }
}

/// Skip a step the engine never dispatched, along with everything nested in it
async fn skip_step(workflow: &Workflow, tracker: &RunTracker, id: &str, reason: &str) {
    tracker.step_skipped(id, reason).await;
    let nested = workflow.descendants(id);
    tracker.settle_nested(&nested, StepStatus::Skipped, reason).await;
}

/// Mark condition branches that will not run
async fn prune<'w>(
    workflow: &'w Workflow,
    tracker: &RunTracker,
    settled: &mut HashMap<&'w str, Settled>,
    branches: impl IntoIterator<Item = &'w StepId>,
    reason: &str,
) {
    for branch in branches {
        if !settled.contains_key(branch.as_str()) {
            settled.insert(branch.as_str(), Settled::Pruned);
            skip_step(workflow, tracker, branch, reason).await;
        }
    }
}

/// Outcome of a step's `when` guard; `None` when it has none
fn guard(step: &WorkflowStep, context: &WorkflowContext) -> Option<Result<bool, StepError>> {
    let src = step.when.as_deref()?;
    Some(
        Expression::parse(src)
            .map_err(|e| StepError::execution(format!("when: {}", e)))
            .and_then(|expr| expr.evaluate(&|r: &Reference| context.resolve(r))),
    )
}

/// Whether a pending top-level step can start, must wait, or is skipped
fn readiness(step: &WorkflowStep, settled: &HashMap<&str, Settled>) -> Readiness {
    let mut any_blocked = false;
    let mut all_pruned = !step.depends_on.is_empty();
    for dep in &step.depends_on {
        match settled.get(dep.as_str()) {
            None => return Readiness::Wait,
            Some(Settled::Succeeded) => all_pruned = false,
            Some(Settled::Pruned) => {}
            Some(Settled::Blocked) => {
                any_blocked = true;
                all_pruned = false;
            }
        }
    }
    if step.tolerate_upstream_failure {
        return Readiness::Ready;
    }
    if any_blocked {
        Readiness::Skip(Settled::Blocked, "upstream step failed")
    } else if all_pruned {
        Readiness::Skip(Settled::Pruned, "upstream branch not taken")
    } else {
        Readiness::Ready
    }
}

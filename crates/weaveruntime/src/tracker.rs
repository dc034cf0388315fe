use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use weavecore::{
    EventKind, HookBus, RunFailure, StepError, StepStatus, WorkflowEvent, WorkflowState,
    WorkflowStatus,
};

/// Owns the state of one run and announces every transition on the bus.
///
/// Events carry a snapshot taken under the lock; hooks run after it is
/// released. Nested steps share one state entry across iterations, so a
/// failed run of one holds the entry at `Failed` until its owner starts
/// another attempt.
pub struct RunTracker {
    state: Mutex<WorkflowState>,
    hooks: HookBus,
}

impl RunTracker {
    pub fn new(state: WorkflowState, hooks: HookBus) -> Self {
        Self {
            state: Mutex::new(state),
            hooks,
        }
    }

    pub async fn snapshot(&self) -> WorkflowState {
        self.state.lock().await.clone()
    }

    pub async fn status_of(&self, step_id: &str) -> StepStatus {
        self.state.lock().await.status_of(step_id)
    }

    async fn transition<F>(&self, kind: EventKind, step_id: Option<&str>, apply: F)
    where
        F: FnOnce(&mut WorkflowState) -> WorkflowEventParts,
    {
        let event = {
            let mut state = self.state.lock().await;
            let parts = apply(&mut state);
            let mut event = WorkflowEvent::new(kind, &state);
            event.step_id = step_id.map(str::to_string);
            event.attempt = parts.attempt;
            event.error = parts.error;
            event
        };
        self.hooks.publish(event).await;
    }

    pub async fn workflow_started(&self) {
        self.transition(EventKind::WorkflowStarted, None, |state| {
            state.start();
            WorkflowEventParts::default()
        })
        .await;
    }

    /// Steps still open when the run ends are closed here: running ones as
    /// Cancelled, pending ones as Skipped (or Cancelled for a cancelled run).
    pub async fn workflow_completed(&self, status: WorkflowStatus, failure: Option<RunFailure>) {
        self.transition(EventKind::WorkflowCompleted, None, |state| {
            let now = Utc::now();
            for step in state.steps.values_mut() {
                let (closed, reason) = match step.status {
                    StepStatus::Running => (StepStatus::Cancelled, "run ended while the step was running"),
                    StepStatus::Pending if status == WorkflowStatus::Cancelled => {
                        (StepStatus::Cancelled, "run cancelled before start")
                    }
                    StepStatus::Pending => (StepStatus::Skipped, "never scheduled"),
                    _ => continue,
                };
                if closed == StepStatus::Cancelled {
                    step.finished_at = Some(now);
                }
                step.status = closed;
                step.skip_reason = Some(reason.to_string());
            }
            state.failure = failure;
            state.finish(status);
            WorkflowEventParts {
                attempt: None,
                error: state.failure.as_ref().map(|f| f.message.clone()),
            }
        })
        .await;
    }

    pub async fn step_started(&self, step_id: &str, attempt: u32) {
        self.transition(EventKind::StepStarted, Some(step_id), |state| {
            let step = state.step_mut(step_id);
            if step.nested_failures > 0 {
                return WorkflowEventParts::attempt(attempt);
            }
            step.status = StepStatus::Running;
            step.attempts = attempt;
            if attempt == 1 {
                step.started_at = Some(Utc::now());
                step.finished_at = None;
                step.last_error = None;
                step.output = None;
            }
            WorkflowEventParts::attempt(attempt)
        })
        .await;
    }

    pub async fn step_retried(&self, step_id: &str, attempt: u32, error: &StepError) {
        self.transition(EventKind::StepRetried, Some(step_id), |state| {
            let step = state.step_mut(step_id);
            if step.nested_failures == 0 {
                step.last_error = Some(error.clone());
            }
            WorkflowEventParts::attempt(attempt).with_error(error)
        })
        .await;
    }

    /// `output` is recorded in the state only for top-level scopes
    pub async fn step_succeeded(&self, step_id: &str, attempt: u32, output: Option<Value>) {
        self.transition(EventKind::StepSucceeded, Some(step_id), |state| {
            let step = state.step_mut(step_id);
            if step.nested_failures > 0 {
                return WorkflowEventParts::attempt(attempt);
            }
            step.status = StepStatus::Succeeded;
            step.finished_at = Some(Utc::now());
            step.last_error = None;
            step.output = output;
            WorkflowEventParts::attempt(attempt)
        })
        .await;
    }

    /// `record` is false for nested steps: no output is kept and the failure
    /// is held against later runs of the same step
    pub async fn step_failed(&self, step_id: &str, attempt: u32, error: &StepError, record: bool) {
        self.transition(EventKind::StepFailed, Some(step_id), |state| {
            let step = state.step_mut(step_id);
            if record {
                step.output = error.partial_output().cloned();
            } else {
                step.nested_failures += 1;
                if step.nested_failures > 1 {
                    return WorkflowEventParts::attempt(attempt).with_error(error);
                }
            }
            step.status = StepStatus::Failed;
            step.attempts = attempt;
            step.finished_at = Some(Utc::now());
            step.last_error = Some(error.clone());
            WorkflowEventParts::attempt(attempt).with_error(error)
        })
        .await;
    }

    pub async fn step_cancelled(&self, step_id: &str, reason: &str) {
        self.transition(EventKind::StepCancelled, Some(step_id), |state| {
            let step = state.step_mut(step_id);
            if step.nested_failures > 0 {
                return WorkflowEventParts {
                    attempt: Some(step.attempts),
                    error: Some(reason.to_string()),
                };
            }
            step.status = StepStatus::Cancelled;
            step.finished_at = Some(Utc::now());
            step.skip_reason = Some(reason.to_string());
            let attempt = (step.attempts > 0).then_some(step.attempts);
            WorkflowEventParts {
                attempt,
                error: Some(reason.to_string()),
            }
        })
        .await;
    }

    pub async fn step_skipped(&self, step_id: &str, reason: &str) {
        self.transition(EventKind::StepSkipped, Some(step_id), |state| {
            let step = state.step_mut(step_id);
            step.status = StepStatus::Skipped;
            step.skip_reason = Some(reason.to_string());
            WorkflowEventParts::default()
        })
        .await;
    }

    /// Forget failures nested steps carried from the owner's last attempt
    pub async fn reset_nested(&self, step_ids: &[&str]) {
        let mut state = self.state.lock().await;
        for id in step_ids {
            state.step_mut(id).nested_failures = 0;
        }
    }

    /// Cancel nested steps left running when their owner's attempt was cut off
    pub async fn interrupt_nested(&self, step_ids: &[&str], reason: &str) {
        for id in step_ids {
            if self.status_of(id).await == StepStatus::Running {
                self.step_cancelled(id, reason).await;
            }
        }
    }

    /// Close nested steps that never ran, as `Skipped` or `Cancelled`
    pub async fn settle_nested(&self, step_ids: &[&str], status: StepStatus, reason: &str) {
        for id in step_ids {
            if self.status_of(id).await != StepStatus::Pending {
                continue;
            }
            match status {
                StepStatus::Cancelled => self.step_cancelled(id, reason).await,
                _ => self.step_skipped(id, reason).await,
            }
        }
    }
}

#[derive(Default)]
struct WorkflowEventParts {
    attempt: Option<u32>,
    error: Option<String>,
}

impl WorkflowEventParts {
    fn attempt(attempt: u32) -> Self {
        Self {
            attempt: Some(attempt),
            error: None,
        }
    }

    fn with_error(mut self, error: &StepError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weavecore::StepId;

    #[tokio::test]
    async fn transitions_update_state_and_emit() {
        let ids: Vec<StepId> = vec!["a".into()];
        let bus = HookBus::new(16);
        let mut rx = bus.stream();
        let tracker = RunTracker::new(WorkflowState::new("wf".into(), &ids), bus);

        tracker.workflow_started().await;
        tracker.step_started("a", 1).await;
        tracker
            .step_retried("a", 1, &StepError::execution("flaky"))
            .await;
        tracker.step_started("a", 2).await;
        tracker.step_succeeded("a", 2, Some(serde_json::json!(1))).await;

        let state = tracker.snapshot().await;
        let a = state.step("a").unwrap();
        assert_eq!(a.status, StepStatus::Succeeded);
        assert_eq!(a.attempts, 2);
        assert!(a.last_error.is_none());

        let kinds: Vec<EventKind> = (0..5).map(|_| rx.try_recv().unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::WorkflowStarted,
                EventKind::StepStarted,
                EventKind::StepRetried,
                EventKind::StepStarted,
                EventKind::StepSucceeded,
            ]
        );
    }

    #[tokio::test]
    async fn nested_failure_is_held_until_reset() {
        let ids: Vec<StepId> = vec!["body".into()];
        let tracker = RunTracker::new(WorkflowState::new("wf".into(), &ids), HookBus::new(16));

        tracker.step_started("body", 1).await;
        tracker
            .step_failed("body", 1, &StepError::execution("item 2"), false)
            .await;
        tracker.step_started("body", 1).await;
        tracker.step_succeeded("body", 1, None).await;

        let body = tracker.snapshot().await.steps["body"].clone();
        assert_eq!(body.status, StepStatus::Failed);
        assert_eq!(body.last_error, Some(StepError::execution("item 2")));
        assert_eq!(body.nested_failures, 1);

        tracker.reset_nested(&["body"]).await;
        tracker.step_started("body", 1).await;
        tracker.step_succeeded("body", 1, None).await;
        let body = tracker.snapshot().await.steps["body"].clone();
        assert_eq!(body.status, StepStatus::Succeeded);
        assert!(body.last_error.is_none());
    }

    #[tokio::test]
    async fn completion_closes_open_steps() {
        let ids: Vec<StepId> = vec!["running".into(), "pending".into(), "done".into()];
        let tracker = RunTracker::new(WorkflowState::new("wf".into(), &ids), HookBus::new(16));

        tracker.workflow_started().await;
        tracker.step_started("running", 1).await;
        tracker.step_started("done", 1).await;
        tracker.step_succeeded("done", 1, None).await;
        tracker.workflow_completed(WorkflowStatus::Failed, None).await;

        let state = tracker.snapshot().await;
        assert_eq!(state.status_of("running"), StepStatus::Cancelled);
        assert!(state.steps["running"].finished_at.is_some());
        assert_eq!(state.status_of("pending"), StepStatus::Skipped);
        assert_eq!(state.status_of("done"), StepStatus::Succeeded);
    }
}

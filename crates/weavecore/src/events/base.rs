use crate::state::{RunId, WorkflowState};
use crate::workflow::{StepId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle points a hook can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    StepStarted,
    StepSucceeded,
    StepFailed,
    StepRetried,
    StepSkipped,
    StepCancelled,
    WorkflowCompleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::StepStarted => "step_started",
            EventKind::StepSucceeded => "step_succeeded",
            EventKind::StepFailed => "step_failed",
            EventKind::StepRetried => "step_retried",
            EventKind::StepSkipped => "step_skipped",
            EventKind::StepCancelled => "step_cancelled",
            EventKind::WorkflowCompleted => "workflow_completed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Run state at the moment the event fired
    pub state: WorkflowState,
}

impl WorkflowEvent {
    pub fn new(kind: EventKind, state: &WorkflowState) -> Self {
        Self {
            kind,
            run_id: state.run_id,
            workflow_id: state.workflow_id.clone(),
            step_id: None,
            attempt: None,
            error: None,
            timestamp: Utc::now(),
            state: state.clone(),
        }
    }

    pub fn for_step(mut self, step_id: impl Into<StepId>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

/// Observer callback. Errors are logged by the bus and never reach the run.
pub trait Hook: Send + Sync {
    fn on_event(&self, event: &WorkflowEvent) -> Result<(), HookError>;
}

impl<F> Hook for F
where
    F: Fn(&WorkflowEvent) -> Result<(), HookError> + Send + Sync,
{
    fn on_event(&self, event: &WorkflowEvent) -> Result<(), HookError> {
        self(event)
    }
}

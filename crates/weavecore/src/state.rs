use crate::workflow::{StepId, WorkflowId};
use crate::StepError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Runs of a nested step that failed during its owner's current attempt.
    /// While non-zero the step stays `Failed` even if a later run succeeds.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub nested_failures: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
            output: None,
            skip_reason: None,
            nested_failures: 0,
        }
    }
}

impl StepState {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Why a run ended in `Failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub step_id: Option<StepId>,
    pub message: String,
    /// Cause chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl RunFailure {
    pub fn from_step(step_id: &str, error: &StepError) -> Self {
        let mut chain = vec![error.to_string()];
        let mut current = error;
        while let StepError::Partial { cause, .. } = current {
            current = cause;
            chain.push(current.to_string());
        }
        Self {
            step_id: Some(step_id.to_string()),
            message: format!("step '{}' failed: {}", step_id, error),
            chain,
        }
    }
}

/// Observable state of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub steps: BTreeMap<StepId, StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}

impl WorkflowState {
    pub fn new<'a>(workflow_id: WorkflowId, step_ids: impl IntoIterator<Item = &'a StepId>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            workflow_id,
            status: WorkflowStatus::Pending,
            steps: step_ids
                .into_iter()
                .map(|id| (id.clone(), StepState::default()))
                .collect(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            failure: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepState> {
        self.steps.get(id)
    }

    pub fn step_mut(&mut self, id: &str) -> &mut StepState {
        self.steps.entry(id.to_string()).or_default()
    }

    pub fn status_of(&self, id: &str) -> StepStatus {
        self.steps
            .get(id)
            .map(|s| s.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn ids_with(&self, status: StepStatus) -> Vec<&StepId> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn start(&mut self) {
        self.status = WorkflowStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: WorkflowStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }
}

use crate::workflow::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Problems found before a run starts. None of these ever reach a step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(StepId),

    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<StepId> },

    #[error("step '{step}' references unknown step '{reference}'")]
    UnknownStepReference { step: StepId, reference: String },

    #[error("invalid step '{step}': {reason}")]
    InvalidStep { step: StepId, reason: String },
}

/// Failure of a single step attempt
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("cannot resolve '{reference}': {reason}")]
    VariableResolution { reference: String, reason: String },

    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("{message}")]
    Execution { message: String },

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The step failed after producing part of its output (Loop, Parallel)
    #[error("{cause}")]
    Partial { output: Value, cause: Box<StepError> },

    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    pub fn execution(message: impl Into<String>) -> Self {
        StepError::Execution {
            message: message.into(),
        }
    }

    pub fn invalid_input(name: impl Into<String>, reason: impl Into<String>) -> Self {
        StepError::InvalidInput {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn partial(output: Value, cause: StepError) -> Self {
        StepError::Partial {
            output,
            cause: Box::new(cause),
        }
    }

    /// Unresolvable references and malformed inputs fail the same way on
    /// every attempt, so they are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Execution { .. } | StepError::Timeout { .. } => true,
            StepError::Partial { cause, .. } => cause.is_retryable(),
            StepError::VariableResolution { .. }
            | StepError::InvalidInput { .. }
            | StepError::Cancelled => false,
        }
    }

    /// The error with any partial-output wrapper removed
    pub fn root(&self) -> &StepError {
        match self {
            StepError::Partial { cause, .. } => cause.root(),
            other => other,
        }
    }

    pub fn partial_output(&self) -> Option<&Value> {
        match self {
            StepError::Partial { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Rejected write to the run context
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("output for step '{0}' is already published")]
    AlreadyPublished(StepId),
}

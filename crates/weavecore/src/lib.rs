//! Core abstractions for the weave workflow engine
//!
//! Workflow definitions, interpolation references and condition
//! expressions, the per-run output context, run state and lifecycle events.
//! Nothing here schedules or executes steps.

mod context;
mod error;
pub mod events;
pub mod expression;
mod reference;
mod state;
mod template;
mod value;
mod workflow;

pub use context::WorkflowContext;
pub use error::{ContextError, StepError, ValidationError};
pub use expression::{CompareOp, Expression, ExpressionError};
pub use reference::{is_ident_char, PathSegment, Reference, ReferenceError};
pub use state::{RunFailure, RunId, StepState, StepStatus, WorkflowState, WorkflowStatus};
pub use template::{Template, TextPart};
pub use value::{compare, loose_eq, ValueExt};
pub use workflow::{
    ChildFailurePolicy, FailurePolicy, InputSlot, LoopMode, RetryPolicy, StepId, StepKind,
    StepKindTag, Workflow, WorkflowId, WorkflowSettings, WorkflowStep, INPUT_ROOT, RESERVED_IDS,
};
pub use events::*;
pub use serde_json::{Map, Value};

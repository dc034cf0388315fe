//! Workflow execution runtime
//!
//! Validates workflows into execution plans, dispatches steps through the
//! executor registry with retry, timeout and cancellation, and drives whole
//! runs to a terminal state.

mod dispatch;
mod engine;
pub mod loader;
mod registry;
pub mod resolver;
mod runtime;
mod services;
mod tracker;

pub use dispatch::{Dispatcher, StepOutcome};
pub use engine::{EngineError, RunReport, WorkflowEngine};
pub use loader::{load_workflow, parse_workflow, DocumentFormat};
pub use registry::{ExecutorRegistry, StepExecutor, StepInvocation};
pub use resolver::{resolve, ExecutionPlan};
pub use runtime::{RunHandle, Runtime, RuntimeConfig};
pub use services::{
    DeliveryStatus, Notifier, NotifyError, Script, ScriptError, ScriptRegistry, ScriptScope,
    ToolBox, ToolError, ToolRunner, TransformError, Transformer, TransformerRegistry,
};
pub use tracker::RunTracker;

//! Standard step library
//!
//! One executor per step kind, the built-in transformers, and helpers to
//! wire them into an [`ExecutorRegistry`].

mod builtins;
mod condition;
mod delay;
mod email;
mod loop_step;
mod parallel;
mod script;
mod tool;
mod transform;
mod webhook;

pub use builtins::builtin_transformers;
pub use condition::ConditionExecutor;
pub use delay::DelayExecutor;
pub use email::{EmailExecutor, LogNotifier};
pub use loop_step::LoopExecutor;
pub use parallel::ParallelExecutor;
pub use script::ScriptExecutor;
pub use tool::ToolExecutor;
pub use transform::TransformExecutor;
pub use webhook::WebhookExecutor;

use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{StepError, Value};
use weaveruntime::{
    ExecutorRegistry, Notifier, Script, ScriptRegistry, ToolBox, ToolRunner, Transformer,
    TransformerRegistry,
};

/// Collaborators handed to the executors that need them
#[derive(Clone)]
pub struct StepServices {
    pub tools: Arc<dyn ToolRunner>,
    pub notifier: Arc<dyn Notifier>,
    pub transformers: TransformerRegistry,
    pub scripts: ScriptRegistry,
}

impl Default for StepServices {
    fn default() -> Self {
        Self {
            tools: Arc::new(ToolBox::new()),
            notifier: Arc::new(LogNotifier),
            transformers: builtin_transformers(),
            scripts: ScriptRegistry::new(),
        }
    }
}

impl StepServices {
    pub fn with_tools(mut self, tools: impl ToolRunner + 'static) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn with_transformer(mut self, name: &str, transformer: impl Transformer + 'static) -> Self {
        self.transformers.register(name, transformer);
        self
    }

    pub fn with_script(mut self, name: &str, script: impl Script + 'static) -> Self {
        self.scripts.register(name, script);
        self
    }
}

/// Register an executor for every step kind
pub fn register_all(registry: &mut ExecutorRegistry, services: StepServices) {
    registry.register(Arc::new(ToolExecutor::new(services.tools)));
    registry.register(Arc::new(ConditionExecutor));
    registry.register(Arc::new(ParallelExecutor));
    registry.register(Arc::new(LoopExecutor));
    registry.register(Arc::new(TransformExecutor::new(services.transformers)));
    registry.register(Arc::new(DelayExecutor));
    registry.register(Arc::new(ScriptExecutor::new(services.scripts)));
    registry.register(Arc::new(WebhookExecutor::new()));
    registry.register(Arc::new(EmailExecutor::new(services.notifier)));
}

pub fn standard_registry(services: StepServices) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    register_all(&mut registry, services);
    registry
}

/// Error reported by an owner step when one of its nested steps failed.
/// Deterministic causes stay as they are so the owner is not retried.
pub(crate) fn child_failure(child: &str, error: StepError) -> StepError {
    if error.is_retryable() {
        StepError::execution(format!("'{}' failed: {}", child, error))
    } else {
        error
    }
}

/// Loop iteration bindings
pub(crate) fn iteration_bindings(
    item_var: &str,
    item: Value,
    index_var: &str,
    index: usize,
) -> HashMap<String, Value> {
    HashMap::from([
        (item_var.to_string(), item),
        (index_var.to_string(), Value::from(index)),
    ])
}

use crate::dispatch::{Dispatcher, StepOutcome};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weavecore::{Map, StepError, StepKindTag, Value, Workflow, WorkflowContext, WorkflowStep};

/// Everything an executor sees for one attempt of one step
pub struct StepInvocation<'a> {
    pub step: &'a WorkflowStep,
    /// Inputs after interpolation
    pub inputs: Map<String, Value>,
    pub context: &'a WorkflowContext,
    pub cancel: &'a CancellationToken,
    pub attempt: u32,
    pub(crate) dispatcher: &'a Dispatcher,
}

impl<'a> StepInvocation<'a> {
    pub fn input(&self, name: &str) -> Result<&Value, StepError> {
        self.inputs
            .get(name)
            .ok_or_else(|| StepError::invalid_input(name, "missing"))
    }

    pub fn workflow(&self) -> &'a Workflow {
        self.dispatcher.workflow()
    }

    /// Run a nested step through the dispatcher, with its own retry policy,
    /// timeout and lifecycle events. Nested runs share the owner's slot.
    pub fn run_child<'b>(
        &'b self,
        step_id: &'b str,
        context: &'b WorkflowContext,
        cancel: &'b CancellationToken,
    ) -> BoxFuture<'b, StepOutcome> {
        self.dispatcher.run_step(step_id, context, cancel)
    }
}

/// Execution strategy for one step kind
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn kind(&self) -> StepKindTag;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<Value, StepError>;
}

/// Executor lookup table keyed by step kind
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepKindTag, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, replacing any previous one for its kind
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        let kind = executor.kind();
        tracing::debug!("Registering step executor: {}", kind);
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: StepKindTag) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(&kind)
    }

    pub fn contains(&self, kind: StepKindTag) -> bool {
        self.executors.contains_key(&kind)
    }

    /// Registered kinds in a stable order
    pub fn kinds(&self) -> Vec<StepKindTag> {
        let mut kinds: Vec<StepKindTag> = self.executors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn description(&self, kind: StepKindTag) -> Option<&str> {
        self.executors.get(&kind).map(|e| e.description())
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

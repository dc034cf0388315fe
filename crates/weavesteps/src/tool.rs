use async_trait::async_trait;
use std::sync::Arc;
use weavecore::{StepError, StepKind, StepKindTag, Value};
use weaveruntime::{StepExecutor, StepInvocation, ToolError, ToolRunner};

/// Forwards every resolved input to a named tool
pub struct ToolExecutor {
    runner: Arc<dyn ToolRunner>,
}

impl ToolExecutor {
    pub fn new(runner: Arc<dyn ToolRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StepExecutor for ToolExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Tool
    }

    fn description(&self) -> &str {
        "Run a named tool with the step inputs as arguments"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Tool { tool } = &inv.step.kind else {
            return Err(StepError::execution("tool executor given a non-tool step"));
        };
        tracing::debug!(step_id = %inv.step.id, tool = %tool, "Running tool");

        self.runner
            .run(tool, &inv.inputs)
            .await
            .map_err(|e| match e {
                ToolError::InvalidInput { name, reason } => StepError::InvalidInput { name, reason },
                other => StepError::execution(other.to_string()),
            })
    }
}

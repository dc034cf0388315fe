use async_trait::async_trait;
use weavecore::{StepError, StepKind, StepKindTag, Value};
use weaveruntime::{ScriptRegistry, ScriptScope, StepExecutor, StepInvocation};

pub struct ScriptExecutor {
    scripts: ScriptRegistry,
}

impl ScriptExecutor {
    pub fn new(scripts: ScriptRegistry) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl StepExecutor for ScriptExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Script
    }

    fn description(&self) -> &str {
        "Call a registered script with the step inputs as its scope"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Script { script } = &inv.step.kind else {
            return Err(StepError::execution("script executor given a non-script step"));
        };
        let callable = self.scripts.get(script).ok_or_else(|| {
            StepError::invalid_input("script", format!("unknown script '{}'", script))
        })?;

        let scope = ScriptScope::new(inv.inputs);
        callable
            .call(&scope)
            .map_err(|e| StepError::execution(format!("script '{}': {}", script, e)))
    }
}

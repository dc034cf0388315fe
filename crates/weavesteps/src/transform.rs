use async_trait::async_trait;
use weavecore::{StepError, StepKind, StepKindTag, Value};
use weaveruntime::{StepExecutor, StepInvocation, TransformerRegistry};

/// Applies a named transformer to the `data` input
pub struct TransformExecutor {
    transformers: TransformerRegistry,
}

impl TransformExecutor {
    pub fn new(transformers: TransformerRegistry) -> Self {
        Self { transformers }
    }
}

#[async_trait]
impl StepExecutor for TransformExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::DataTransform
    }

    fn description(&self) -> &str {
        "Apply a registered pure transformation to data"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::DataTransform { transform, params } = &inv.step.kind else {
            return Err(StepError::execution("transform executor given a non-transform step"));
        };
        let transformer = self.transformers.get(transform).ok_or_else(|| {
            StepError::invalid_input("transform", format!("unknown transform '{}'", transform))
        })?;

        let data = inv.input("data")?;
        transformer
            .apply(data, params)
            .map_err(|e| StepError::invalid_input("data", format!("{}: {}", transform, e)))
    }
}

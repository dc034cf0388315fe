use async_trait::async_trait;
use weavecore::{Expression, Reference, StepError, StepKind, StepKindTag, Value};
use weaveruntime::{StepExecutor, StepInvocation};

/// Evaluates a boolean expression over published outputs
pub struct ConditionExecutor;

#[async_trait]
impl StepExecutor for ConditionExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Condition
    }

    fn description(&self) -> &str {
        "Evaluate an expression and select the then or otherwise branch"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Condition { expression, .. } = &inv.step.kind else {
            return Err(StepError::execution("condition executor given a non-condition step"));
        };
        let expr = Expression::parse(expression)
            .map_err(|e| StepError::invalid_input("expression", e.to_string()))?;
        let matched = expr.evaluate(&|r: &Reference| inv.context.resolve(r))?;
        tracing::debug!(step_id = %inv.step.id, matched, "Condition evaluated");
        Ok(Value::Bool(matched))
    }
}

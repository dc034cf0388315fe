use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use weavecore::{StepError, StepKindTag, Value, ValueExt};
use weaveruntime::{StepExecutor, StepInvocation};

/// Waits without holding a thread; cancellation ends the wait early
pub struct DelayExecutor;

#[async_trait]
impl StepExecutor for DelayExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Delay
    }

    fn description(&self) -> &str {
        "Wait for duration_ms milliseconds"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let raw = inv.input("duration_ms")?;
        let ms = match raw.as_f64() {
            Some(ms) if ms >= 0.0 => ms as u64,
            _ => {
                return Err(StepError::invalid_input(
                    "duration_ms",
                    format!("expected a non-negative number, got {}", raw.kind_name()),
                ))
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "duration_ms": ms })),
            _ = inv.cancel.cancelled() => Err(StepError::Cancelled),
        }
    }
}

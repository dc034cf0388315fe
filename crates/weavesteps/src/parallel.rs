use crate::child_failure;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use weavecore::{ChildFailurePolicy, Map, StepError, StepKind, StepKindTag, Value};
use weaveruntime::{StepExecutor, StepInvocation, StepOutcome};

/// Runs child steps concurrently and collects their outputs by id
pub struct ParallelExecutor;

#[async_trait]
impl StepExecutor for ParallelExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Parallel
    }

    fn description(&self) -> &str {
        "Run child steps concurrently; output maps child id to output"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Parallel {
            children,
            on_child_failure,
        } = &inv.step.kind
        else {
            return Err(StepError::execution("parallel executor given a non-parallel step"));
        };

        // Fresh frame per attempt so a retried owner can republish its children
        let scope = inv.context.scoped(HashMap::new());
        let group = inv.cancel.child_token();
        let workflow = inv.workflow();

        let mut running: FuturesUnordered<_> = children
            .iter()
            .map(|child| {
                let (inv, scope, group) = (&inv, &scope, &group);
                async move { (child.as_str(), inv.run_child(child, scope, group).await) }
            })
            .collect();

        let mut outputs = Map::new();
        let mut failure: Option<StepError> = None;
        let mut cancelled = false;

        while let Some((child, outcome)) = running.next().await {
            match outcome {
                StepOutcome::Succeeded(output) => {
                    outputs.insert(child.to_string(), output);
                }
                StepOutcome::Failed { error, .. } => {
                    let tolerated = workflow
                        .find_step(child)
                        .is_some_and(|s| s.continue_on_failure);
                    if tolerated {
                        tracing::warn!(step_id = %inv.step.id, child, "Child failed, recording null: {}", error);
                        outputs.insert(child.to_string(), Value::Null);
                        continue;
                    }
                    if failure.is_none() {
                        if *on_child_failure == ChildFailurePolicy::AbortSiblings {
                            tracing::debug!(step_id = %inv.step.id, child, "Aborting sibling steps");
                            group.cancel();
                        }
                        failure = Some(child_failure(child, error));
                    }
                }
                StepOutcome::Cancelled => cancelled = true,
            }
        }
        drop(running);

        if let Some(cause) = failure {
            return Err(StepError::partial(Value::Object(outputs), cause));
        }
        if cancelled {
            return Err(StepError::Cancelled);
        }
        Ok(Value::Object(outputs))
    }
}

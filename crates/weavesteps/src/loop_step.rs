use crate::{child_failure, iteration_bindings};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use weavecore::{
    ChildFailurePolicy, LoopMode, StepError, StepKind, StepKindTag, Value, ValueExt,
    WorkflowContext,
};
use weaveruntime::{StepExecutor, StepInvocation, StepOutcome};

/// Runs the body step once per item of the `items` input
pub struct LoopExecutor;

struct LoopShape<'a> {
    body: &'a str,
    item_var: &'a str,
    index_var: &'a str,
    tolerate: bool,
    policy: ChildFailurePolicy,
}

#[async_trait]
impl StepExecutor for LoopExecutor {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Loop
    }

    fn description(&self) -> &str {
        "Run the body step for each item; output is the ordered list of results"
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Loop {
            body,
            item_var,
            index_var,
            mode,
            max_iterations,
            on_item_failure,
        } = &inv.step.kind
        else {
            return Err(StepError::execution("loop executor given a non-loop step"));
        };

        let raw = inv.input("items")?;
        let Some(items) = raw.as_array() else {
            return Err(StepError::invalid_input(
                "items",
                format!("expected an array, got {}", raw.kind_name()),
            ));
        };
        let limit = max_iterations.unwrap_or(items.len()).min(items.len());
        let items = items[..limit].to_vec();

        let shape = LoopShape {
            body: body.as_str(),
            item_var: item_var.as_str(),
            index_var: index_var.as_str(),
            tolerate: inv
                .workflow()
                .find_step(body)
                .is_some_and(|s| s.continue_on_failure),
            policy: *on_item_failure,
        };
        tracing::debug!(step_id = %inv.step.id, items = items.len(), mode = ?mode, "Starting loop");

        match mode {
            LoopMode::Sequential => sequential(&inv, &shape, items).await,
            LoopMode::Parallel => parallel(&inv, &shape, items).await,
        }
    }
}

async fn sequential(
    inv: &StepInvocation<'_>,
    shape: &LoopShape<'_>,
    items: Vec<Value>,
) -> Result<Value, StepError> {
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let scope = inv
            .context
            .scoped(iteration_bindings(shape.item_var, item, shape.index_var, index));
        match inv.run_child(shape.body, &scope, inv.cancel).await {
            StepOutcome::Succeeded(output) => results.push(output),
            StepOutcome::Failed { .. } if shape.tolerate => results.push(Value::Null),
            StepOutcome::Failed { error, .. } => {
                tracing::debug!(step_id = %inv.step.id, index, "Loop stopped at failed item");
                return Err(StepError::partial(
                    Value::Array(results),
                    child_failure(shape.body, error),
                ));
            }
            StepOutcome::Cancelled => return Err(StepError::Cancelled),
        }
    }
    Ok(Value::Array(results))
}

async fn parallel(
    inv: &StepInvocation<'_>,
    shape: &LoopShape<'_>,
    items: Vec<Value>,
) -> Result<Value, StepError> {
    let scopes: Vec<WorkflowContext> = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            inv.context
                .scoped(iteration_bindings(shape.item_var, item, shape.index_var, index))
        })
        .collect();
    let group = inv.cancel.child_token();

    let mut running: FuturesUnordered<_> = scopes
        .iter()
        .enumerate()
        .map(|(index, scope)| {
            let group = &group;
            async move { (index, inv.run_child(shape.body, scope, group).await) }
        })
        .collect();

    let mut results: Vec<Option<Value>> = vec![None; scopes.len()];
    let mut failure: Option<StepError> = None;
    let mut cancelled = false;

    while let Some((index, outcome)) = running.next().await {
        match outcome {
            StepOutcome::Succeeded(output) => results[index] = Some(output),
            StepOutcome::Failed { .. } if shape.tolerate => results[index] = Some(Value::Null),
            StepOutcome::Failed { error, .. } => {
                if failure.is_none() {
                    if shape.policy == ChildFailurePolicy::AbortSiblings {
                        group.cancel();
                    }
                    failure = Some(child_failure(shape.body, error));
                }
            }
            StepOutcome::Cancelled => cancelled = true,
        }
    }
    drop(running);

    if let Some(cause) = failure {
        let partial = results
            .into_iter()
            .map(|r| r.unwrap_or(Value::Null))
            .collect();
        return Err(StepError::partial(Value::Array(partial), cause));
    }
    if cancelled {
        return Err(StepError::Cancelled);
    }
    Ok(Value::Array(results.into_iter().flatten().collect()))
}

use serde_json::json;
use std::collections::HashMap;
use weavecore::{
    ChildFailurePolicy, LoopMode, Reference, StepError, StepKind, StepKindTag, ValidationError,
    Workflow, WorkflowContext, WorkflowStep,
};

const DOCUMENT: &str = r#"{
    "name": "orders",
    "version": "2.0.0",
    "settings": {"max_concurrency": 4, "failure_policy": "fail_fast"},
    "steps": [
        {"id": "fetch", "kind": "tool", "tool": "orders.list",
         "inputs": {"customer": "$input.customer"},
         "retry": {"max_attempts": 5, "delay_ms": 10, "backoff_multiplier": 2.0}},
        {"id": "each", "kind": "loop", "body": "price", "mode": "parallel",
         "depends_on": ["fetch"], "inputs": {"items": "$fetch.orders"}},
        {"id": "price", "kind": "data_transform", "transform": "pick",
         "params": {"fields": ["total"]}, "inputs": {"data": "$item"}},
        {"id": "wait", "kind": "delay", "depends_on": ["each"], "inputs": {"duration_ms": 10}},
        {"id": "notify", "kind": "email", "depends_on": ["wait"],
         "inputs": {"to": "$input.email", "subject": "Orders", "body": "You have ${fetch.count} orders"}}
    ]
}"#;

#[test]
fn test_document_round_trip_keeps_kinds_and_defaults() {
    let wf = Workflow::from_json(DOCUMENT).unwrap();
    wf.validate_shape().unwrap();

    assert_eq!(wf.version, "2.0.0");
    assert_eq!(wf.settings.max_concurrency, Some(4));
    let tags: Vec<StepKindTag> = wf.steps.iter().map(|s| s.kind.tag()).collect();
    assert_eq!(
        tags,
        vec![
            StepKindTag::Tool,
            StepKindTag::Loop,
            StepKindTag::DataTransform,
            StepKindTag::Delay,
            StepKindTag::Email
        ]
    );

    match &wf.find_step("each").unwrap().kind {
        StepKind::Loop {
            item_var,
            index_var,
            mode,
            on_item_failure,
            ..
        } => {
            assert_eq!(item_var, "item");
            assert_eq!(index_var, "index");
            assert_eq!(*mode, LoopMode::Parallel);
            assert_eq!(*on_item_failure, ChildFailurePolicy::FinishSiblings);
        }
        other => panic!("expected a loop, got {:?}", other),
    }
    assert_eq!(wf.find_step("fetch").unwrap().retry.as_ref().unwrap().max_attempts, 5);

    let again = Workflow::from_json(&serde_json::to_string(&wf).unwrap()).unwrap();
    assert_eq!(again, wf);
}

#[test]
fn test_loop_body_sees_iteration_bindings() {
    let wf = Workflow::from_json(DOCUMENT).unwrap();
    let bindings = wf.scope_bindings("price");
    assert!(bindings.contains("item"));
    assert!(bindings.contains("index"));
    assert!(wf.scope_bindings("notify").is_empty());
    assert_eq!(wf.owners().get("price"), Some(&"each"));
}

#[test]
fn test_shape_errors() {
    let empty = Workflow::new("empty");
    assert_eq!(
        empty.validate_shape(),
        Err(ValidationError::EmptyWorkflow("empty".into()))
    );

    let dup = Workflow::new("dup")
        .with_step(WorkflowStep::tool("a", "t"))
        .with_step(WorkflowStep::tool("a", "t"));
    assert_eq!(dup.validate_shape(), Err(ValidationError::DuplicateStepId("a".into())));

    let missing_input = Workflow::new("email").with_step(WorkflowStep::new("mail", StepKind::Email));
    assert!(matches!(
        missing_input.validate_shape(),
        Err(ValidationError::InvalidStep { .. })
    ));

    let branch_without_dependency = Workflow::new("branch")
        .with_step(WorkflowStep::condition("c", "$input.x > 1", &["t"], &[]))
        .with_step(WorkflowStep::tool("t", "noop"));
    assert!(matches!(
        branch_without_dependency.validate_shape(),
        Err(ValidationError::InvalidStep { step, .. }) if step == "t"
    ));
}

#[test]
fn test_context_resolution_through_frames() {
    let ctx = WorkflowContext::new(json!({"user": {"name": "ada"}}));
    ctx.publish("fetch", json!({"orders": [10, 20]})).unwrap();

    let frame = ctx.scoped(HashMap::from([("item".to_string(), json!(20))]));
    let item: Reference = "$item".parse().unwrap();
    assert_eq!(frame.resolve(&item).unwrap(), json!(20));
    let second: Reference = "$fetch.orders[1]".parse().unwrap();
    assert_eq!(frame.resolve(&second).unwrap(), json!(20));

    frame.publish("price", json!(1)).unwrap();
    assert!(!ctx.contains("price"));
    assert!(matches!(ctx.resolve(&item), Err(StepError::VariableResolution { .. })));

    let name: Reference = "$input.user.name".parse().unwrap();
    assert_eq!(ctx.resolve(&name).unwrap(), json!("ada"));
}

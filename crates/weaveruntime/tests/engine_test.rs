use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weavecore::{
    EventKind, FailurePolicy, HookError, StepError, StepKind, StepKindTag, StepStatus, Value,
    Workflow, WorkflowEvent, WorkflowSettings, WorkflowStatus, WorkflowStep,
};
use weaveruntime::{
    EngineError, ExecutorRegistry, RuntimeConfig, StepExecutor, StepInvocation, ToolBox,
    ToolError, ToolRunner, WorkflowEngine,
};

/// Tool executor over a ToolBox, with an optional per-call sleep
struct TestTools {
    tools: ToolBox,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl StepExecutor for TestTools {
    fn kind(&self) -> StepKindTag {
        StepKindTag::Tool
    }

    async fn execute(&self, inv: StepInvocation<'_>) -> Result<Value, StepError> {
        let StepKind::Tool { tool } = &inv.step.kind else {
            return Err(StepError::execution("not a tool step"));
        };
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = inv.inputs.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let result = self.tools.run(tool, &inv.inputs).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map_err(|e| match e {
            ToolError::InvalidInput { name, reason } => StepError::InvalidInput { name, reason },
            other => StepError::execution(other.to_string()),
        })
    }
}

struct Harness {
    engine: WorkflowEngine,
    calls: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn harness(config: RuntimeConfig) -> Harness {
    init_tracing();
    let tools = ToolBox::new()
        .with_tool("echo", |args| Ok(Value::Object(args.clone())))
        .with_tool("value", |args| Ok(json!({"value": args.get("v").cloned().unwrap_or(json!(0))})))
        .with_tool("fail", |_| Err(ToolError::Failed("always fails".into())))
        .with_tool("reject", |_| {
            Err(ToolError::InvalidInput {
                name: "x".into(),
                reason: "bad".into(),
            })
        });
    let calls = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(TestTools {
        tools,
        calls: calls.clone(),
        in_flight: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
    }));
    Harness {
        engine: WorkflowEngine::with_config(registry, config),
        calls,
        peak,
    }
}

fn tool(id: &str, name: &str) -> WorkflowStep {
    WorkflowStep::tool(id, name)
}

#[tokio::test]
async fn test_linear_run_publishes_outputs() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("linear")
        .with_step(tool("a", "value").with_input("v", "$input.start"))
        .with_step(tool("b", "echo").depends_on("a").with_input("got", "$a.value"));

    let report = h
        .engine
        .run(Arc::new(wf), json!({"start": 7}))
        .await
        .unwrap();

    assert_eq!(report.status(), WorkflowStatus::Succeeded);
    assert_eq!(report.output("b"), Some(&json!({"got": 7})));
    assert_eq!(report.state.step("a").unwrap().output, Some(json!({"value": 7})));
    assert!(report.into_result().is_ok());
}

#[tokio::test]
async fn test_always_failing_step_attempts_exactly_max() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("retry").with_step(tool("a", "fail").with_retry(3, 1));

    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();

    assert_eq!(h.calls.load(Ordering::SeqCst), 3);
    let a = report.state.step("a").unwrap();
    assert_eq!(a.status, StepStatus::Failed);
    assert_eq!(a.attempts, 3);
    assert_eq!(report.status(), WorkflowStatus::Failed);
    match report.into_result() {
        Err(EngineError::RetryExhausted { step, attempts, .. }) => {
            assert_eq!(step, "a");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RetryExhausted, got {:?}", other.map(|r| r.status())),
    }
}

#[tokio::test]
async fn test_unresolved_reference_is_not_retried() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("unresolved")
        .with_step(tool("a", "value"))
        .with_step(
            tool("b", "echo")
                .depends_on("a")
                .with_input("x", "$a.missing.field")
                .with_retry(5, 1),
        );

    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();

    let b = report.state.step("b").unwrap();
    assert_eq!(b.status, StepStatus::Failed);
    assert_eq!(b.attempts, 1);
    assert!(matches!(b.last_error, Some(StepError::VariableResolution { .. })));
    // only step a ever reached the tool
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_input_is_not_retried() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("reject").with_step(tool("a", "reject").with_retry(4, 1));
    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();
    assert_eq!(report.state.step("a").unwrap().attempts, 1);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_counts_as_retryable_failure() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("slow").with_step(
        tool("a", "echo")
            .with_input("sleep_ms", 200)
            .with_timeout_ms(20)
            .with_retry(2, 1),
    );
    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();
    let a = report.state.step("a").unwrap();
    assert_eq!(a.attempts, 2);
    assert_eq!(a.last_error, Some(StepError::Timeout { ms: 20 }));
}

#[tokio::test]
async fn test_failure_skips_dependents_but_not_independent_branches() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("branches")
        .with_step(tool("a", "fail"))
        .with_step(tool("b", "echo").depends_on("a"))
        .with_step(tool("c", "echo").depends_on("b"))
        .with_step(tool("d", "echo"))
        .with_step(tool("cleanup", "echo").depends_on("a").tolerate_upstream_failure());

    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();

    assert_eq!(report.step_status("a"), StepStatus::Failed);
    assert_eq!(report.step_status("b"), StepStatus::Skipped);
    assert_eq!(report.step_status("c"), StepStatus::Skipped);
    assert_eq!(report.step_status("d"), StepStatus::Succeeded);
    assert_eq!(report.step_status("cleanup"), StepStatus::Succeeded);
    assert_eq!(report.status(), WorkflowStatus::Failed);
    let failure = report.state.failure.as_ref().unwrap();
    assert_eq!(failure.step_id.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_continue_on_failure_keeps_run_green() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("optional")
        .with_step(tool("a", "fail").continue_on_failure())
        .with_step(tool("b", "echo"));
    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();
    assert_eq!(report.step_status("a"), StepStatus::Failed);
    assert_eq!(report.status(), WorkflowStatus::Succeeded);
    assert!(report.output("a").is_none());
}

#[tokio::test]
async fn test_dependents_of_tolerated_failure_still_run() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("optional-upstream")
        .with_step(tool("a", "fail").continue_on_failure())
        .with_step(tool("b", "echo").depends_on("a"))
        .with_step(tool("c", "echo").depends_on("a").with_input("x", "$a.value"));
    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();

    assert_eq!(report.step_status("b"), StepStatus::Succeeded);
    let c = report.state.step("c").unwrap();
    assert_eq!(c.status, StepStatus::Failed);
    assert!(matches!(c.last_error, Some(StepError::VariableResolution { .. })));
    assert_eq!(report.status(), WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_fail_fast_skips_unstarted_steps() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("fail-fast")
        .with_settings(WorkflowSettings {
            failure_policy: FailurePolicy::FailFast,
            max_concurrency: Some(1),
            ..Default::default()
        })
        .with_step(tool("a", "fail"))
        .with_step(tool("b", "echo"))
        .with_step(tool("c", "echo"));

    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();

    assert_eq!(report.step_status("a"), StepStatus::Failed);
    assert_eq!(report.step_status("b"), StepStatus::Skipped);
    assert_eq!(report.step_status("c"), StepStatus::Skipped);
    assert_eq!(report.state.step("b").unwrap().skip_reason.as_deref(), Some("fail fast"));
}

#[tokio::test]
async fn test_concurrency_bound_is_respected() {
    let h = harness(RuntimeConfig {
        max_concurrency: 2,
        ..Default::default()
    });
    let mut wf = Workflow::new("wide");
    for i in 0..6 {
        wf.add_step(tool(&format!("s{i}"), "echo").with_input("sleep_ms", 30));
    }
    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();
    assert_eq!(report.status(), WorkflowStatus::Succeeded);
    assert!(h.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_cancel_before_dependents_start() {
    let h = harness(RuntimeConfig::default());
    let wf = Workflow::new("cancel")
        .with_step(tool("a", "echo").with_input("sleep_ms", 100))
        .with_step(tool("b", "echo").depends_on("a"))
        .with_step(tool("c", "echo").depends_on("a"));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let report = h
        .engine
        .execute(Arc::new(wf), Value::Null, Uuid::new_v4(), cancel)
        .await
        .unwrap();

    assert_eq!(report.step_status("a"), StepStatus::Succeeded);
    assert!(report.output("a").is_some());
    assert_eq!(report.step_status("b"), StepStatus::Cancelled);
    assert_eq!(report.step_status("c"), StepStatus::Cancelled);
    assert_eq!(report.status(), WorkflowStatus::Cancelled);
    assert!(matches!(
        report.into_result(),
        Err(EngineError::WorkflowCancelled { .. })
    ));
}

#[tokio::test]
async fn test_validation_errors_prevent_run() {
    let h = harness(RuntimeConfig::default());
    let cyclic = Workflow::new("cyclic")
        .with_step(tool("a", "echo").depends_on("b"))
        .with_step(tool("b", "echo").depends_on("a"));
    assert!(matches!(
        h.engine.run(Arc::new(cyclic), Value::Null).await,
        Err(EngineError::Validation(_))
    ));

    let unsupported = Workflow::new("delay").with_step(WorkflowStep::delay("d", 5));
    assert!(matches!(
        h.engine.run(Arc::new(unsupported), Value::Null).await,
        Err(EngineError::UnsupportedKind { kind: StepKindTag::Delay, .. })
    ));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_hooks_see_lifecycle_and_cannot_break_run() {
    let h = harness(RuntimeConfig::default());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let s = seen.clone();
    h.engine
        .hooks()
        .subscribe_all(move |e: &WorkflowEvent| -> Result<(), HookError> {
            s.lock().unwrap().push((e.kind, e.step_id.clone(), e.attempt));
            Ok(())
        })
        .await;
    h.engine
        .hooks()
        .subscribe(EventKind::StepSucceeded, |_: &WorkflowEvent| -> Result<(), HookError> {
            Err(HookError("observer is broken".into()))
        })
        .await;

    let wf = Workflow::new("hooks")
        .with_step(tool("a", "fail").with_retry(2, 1).continue_on_failure())
        .with_step(tool("b", "echo"));
    let report = h.engine.run(Arc::new(wf), Value::Null).await.unwrap();
    assert_eq!(report.status(), WorkflowStatus::Succeeded);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first().map(|e| e.0), Some(EventKind::WorkflowStarted));
    assert_eq!(seen.last().map(|e| e.0), Some(EventKind::WorkflowCompleted));
    let a_events: Vec<(EventKind, Option<u32>)> = seen
        .iter()
        .filter(|e| e.1.as_deref() == Some("a"))
        .map(|e| (e.0, e.2))
        .collect();
    assert_eq!(
        a_events,
        vec![
            (EventKind::StepStarted, Some(1)),
            (EventKind::StepRetried, Some(1)),
            (EventKind::StepStarted, Some(2)),
            (EventKind::StepFailed, Some(2)),
        ]
    );
}

#[tokio::test]
async fn test_repeated_runs_give_identical_results() {
    let h = harness(RuntimeConfig::default());
    let wf = Arc::new(
        Workflow::new("repeatable")
            .with_step(tool("a", "value").with_input("v", "$input.start"))
            .with_step(tool("b", "echo").depends_on("a").with_input("got", "$a.value"))
            .with_step(tool("c", "echo").depends_on("a").with_input("label", "a=${a.value}"))
            .with_step(tool("d", "fail").depends_on("b").continue_on_failure())
            .with_step(tool("e", "echo").depends_on("c").depends_on("d").with_input("done", true)),
    );

    let first = h.engine.run(Arc::clone(&wf), json!({"start": 3})).await.unwrap();
    let second = h.engine.run(Arc::clone(&wf), json!({"start": 3})).await.unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(first.status(), second.status());
    assert_eq!(first.outputs, second.outputs);
    let statuses = |report: &weaveruntime::RunReport| {
        report
            .state
            .steps
            .iter()
            .map(|(id, s)| (id.clone(), s.status, s.attempts))
            .collect::<Vec<_>>()
    };
    assert_eq!(statuses(&first), statuses(&second));
    assert_eq!(first.step_status("d"), StepStatus::Failed);
}

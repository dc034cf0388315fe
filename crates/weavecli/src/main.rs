// crates/weavecli/src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use weavecore::{EventKind, StepStatus, Workflow, WorkflowEvent, WorkflowStatus, WorkflowStep};
use weaveruntime::{
    load_workflow, resolve, ExecutionPlan, ExecutorRegistry, Runtime, RuntimeConfig, ToolBox,
    ToolError, WorkflowEngine,
};
use weavesteps::{standard_registry, StepServices};

#[derive(Parser)]
#[command(name = "weave")]
#[command(about = "Weave workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file (JSON or YAML)
    Run {
        #[arg(short, long)]
        file: PathBuf,

        /// Run inputs as a JSON object, visible as `$input`
        #[arg(short, long)]
        input: Option<String>,

        /// Runtime config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the config's concurrency bound
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Stop scheduling new steps after the first failure
        #[arg(long)]
        fail_fast: bool,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Check a workflow for cycles, dangling references and bad nesting
    Validate { file: PathBuf },

    /// Print the execution layers of a workflow
    Plan { file: PathBuf },

    /// List step kinds and their executors
    Kinds,

    /// Write an example workflow
    Init {
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            max_concurrency,
            fail_fast,
            verbose,
        } => {
            init_logging(verbose);
            let mut config = match config {
                Some(path) => RuntimeConfig::load(path)?,
                None => RuntimeConfig::default(),
            };
            if let Some(n) = max_concurrency {
                config.max_concurrency = n;
            }
            config.fail_fast |= fail_fast;
            run_workflow(file, input, config).await?;
        }
        Commands::Validate { file } => validate_workflow(file)?,
        Commands::Plan { file } => print_plan(file)?,
        Commands::Kinds => list_kinds(),
        Commands::Init { output } => create_example_workflow(output)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Tools available to `tool` steps run from the command line
fn demo_tools() -> ToolBox {
    ToolBox::new()
        .with_tool("echo", |args| Ok(Value::Object(args.clone())))
        .with_tool("sum", |args| {
            let values = args
                .get("values")
                .and_then(Value::as_array)
                .ok_or_else(|| ToolError::InvalidInput {
                    name: "values".into(),
                    reason: "expected an array of numbers".into(),
                })?;
            Ok(json!(values.iter().filter_map(Value::as_f64).sum::<f64>()))
        })
}

fn services() -> StepServices {
    StepServices::default().with_tools(demo_tools())
}

fn print_event(event: &WorkflowEvent) {
    let step = event.step_id.as_deref().unwrap_or("-");
    match event.kind {
        EventKind::WorkflowStarted => println!("▶️  Workflow started ({})", event.run_id),
        EventKind::StepStarted => {
            println!("  ⚡ {} started (attempt {})", step, event.attempt.unwrap_or(1))
        }
        EventKind::StepSucceeded => println!("  ✅ {} succeeded", step),
        EventKind::StepRetried => println!(
            "  🔁 {} attempt {} failed, retrying: {}",
            step,
            event.attempt.unwrap_or(0),
            event.error.as_deref().unwrap_or("")
        ),
        EventKind::StepFailed => println!(
            "  ❌ {} failed: {}",
            step,
            event.error.as_deref().unwrap_or("")
        ),
        EventKind::StepSkipped => println!("  ⏭️  {} skipped", step),
        EventKind::StepCancelled => println!("  🛑 {} cancelled", step),
        EventKind::WorkflowCompleted => println!("🏁 Workflow finished: {:?}", event.state.status),
    }
}

async fn run_workflow(file: PathBuf, input: Option<String>, config: RuntimeConfig) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());
    let workflow = load_workflow(&file)?;
    println!("📋 Workflow: {} ({} steps)", workflow.name, workflow.steps.len());
    println!();

    let inputs: Value = match input {
        Some(raw) => {
            let parsed: Value = serde_json::from_str(&raw).context("--input is not valid JSON")?;
            if !parsed.is_object() {
                bail!("Input must be a JSON object");
            }
            parsed
        }
        None => json!({}),
    };
    let runtime = Runtime::with_config(standard_registry(services()), config);
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let handle = runtime.start_workflow(workflow, inputs)?;
    let run_id = handle.run_id;
    let cancel = tokio::spawn({
        let token = handle.cancel_token();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("Cancelling run {}", run_id);
                token.cancel();
            }
        }
    });
    let report = handle.wait().await?;
    cancel.abort();

    // Let the listener drain what is already queued
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", report.run_id());
    println!("   Status: {:?}", report.status());
    if let Some(ms) = report.state.duration_ms {
        println!("   Duration: {}ms", ms);
    }
    let succeeded = report.state.ids_with(StepStatus::Succeeded).len();
    println!("   Succeeded: {}/{} steps", succeeded, report.state.steps.len());

    if !report.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (step_id, output) in &report.outputs {
            println!("   {}: {}", step_id, output);
        }
    }

    if let Some(failure) = &report.state.failure {
        println!();
        println!("💥 {}", failure.message);
        for cause in &failure.chain {
            println!("   caused by: {}", cause);
        }
    }

    if report.status() != WorkflowStatus::Succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());
    let workflow = load_workflow(&file)?;
    let plan = check_workflow(standard_registry(services()), &workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Steps: {}", workflow.steps.len());
    println!("   Layers: {}", plan.depth());
    Ok(())
}

/// The same checks the engine runs before starting a workflow
fn check_workflow(registry: ExecutorRegistry, workflow: &Workflow) -> Result<ExecutionPlan> {
    Ok(WorkflowEngine::new(registry).validate(workflow)?)
}

fn print_plan(file: PathBuf) -> Result<()> {
    let workflow = load_workflow(&file)?;
    let plan = resolve(&workflow)?;

    println!("🗺️  Plan for {} ({} layers)", workflow.name, plan.depth());
    for (depth, layer) in plan.layers.iter().enumerate() {
        println!("  {}: {}", depth, layer.join(", "));
    }
    Ok(())
}

fn list_kinds() {
    println!("📦 Step kinds:");
    println!();
    let registry = standard_registry(services());
    for kind in registry.kinds() {
        println!("  • {}", kind);
        if let Some(description) = registry.description(kind) {
            println!("    {}", description);
        }
        for slot in kind.input_contract() {
            let required = if slot.required { "required" } else { "optional" };
            println!("      - {} ({}): {}", slot.name, required, slot.description);
        }
        if kind.accepts_extra_inputs() {
            println!("      - any other named input is passed through");
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let workflow = Workflow::new("Example greeting")
        .with_description("Adds up some numbers and sends a greeting when the total is large")
        .with_step(WorkflowStep::tool("total", "sum").with_input("values", "$input.values"))
        .with_step(
            WorkflowStep::condition("big", "$total > 10", &["greet"], &[]).depends_on("total"),
        )
        .with_step(
            WorkflowStep::email("greet", "$input.email", "Totals", "Your total is ${total}")
                .depends_on("big"),
        );

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  weave run --file {} --input '{{\"values\": [4, 5, 6], \"email\": \"me@example.com\"}}'",
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workflow {
        Workflow::new("check")
            .with_step(WorkflowStep::tool("a", "echo"))
            .with_step(WorkflowStep::delay("b", 5).depends_on("a"))
    }

    #[test]
    fn check_matches_engine_validation() {
        let plan = check_workflow(standard_registry(services()), &sample()).unwrap();
        assert_eq!(plan.depth(), 2);

        let err = check_workflow(ExecutorRegistry::new(), &sample()).unwrap_err();
        assert!(err.to_string().contains("no executor registered"), "got: {err}");
    }

    #[test]
    fn check_rejects_bad_graph() {
        let cyclic = Workflow::new("cycle")
            .with_step(WorkflowStep::tool("a", "echo").depends_on("b"))
            .with_step(WorkflowStep::tool("b", "echo").depends_on("a"));
        assert!(check_workflow(standard_registry(services()), &cyclic).is_err());
    }
}

use crate::engine::{EngineError, RunReport, WorkflowEngine};
use crate::loader::{read_document, DocumentFormat};
use crate::registry::ExecutorRegistry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weavecore::{HookBus, RunId, Value, Workflow, WorkflowEvent, WorkflowId};

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Top-level steps in flight at once, unless a workflow sets its own
    pub max_concurrency: usize,
    pub event_buffer_size: usize,
    pub default_step_timeout_ms: Option<u64>,
    pub fail_fast: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            event_buffer_size: 1000,
            default_step_timeout_ms: None,
            fail_fast: false,
        }
    }
}

impl RuntimeConfig {
    /// Read a JSON or YAML config file; the extension picks the format
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let (src, format) = read_document(path)?;
        format.parse(&src).map_err(|message| EngineError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(src: &str, format: DocumentFormat) -> Result<Self, String> {
        format.parse(src)
    }
}

/// A run started in the background
pub struct RunHandle {
    pub run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunReport, EngineError>>,
}

impl RunHandle {
    /// Stop dispatching new steps; in-flight steps finish or observe the
    /// token at their next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, for handing to signal handlers
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<RunReport, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?
    }
}

/// Main runtime: registered workflows plus the runs currently active
pub struct Runtime {
    engine: Arc<WorkflowEngine>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Arc<Workflow>>>>,
    active: Arc<DashMap<RunId, CancellationToken>>,
}

impl Runtime {
    pub fn new(registry: ExecutorRegistry) -> Self {
        Self::with_config(registry, RuntimeConfig::default())
    }

    pub fn with_config(registry: ExecutorRegistry, config: RuntimeConfig) -> Self {
        Self {
            engine: Arc::new(WorkflowEngine::with_config(registry, config)),
            workflows: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn hooks(&self) -> &HookBus {
        self.engine.hooks()
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.engine.hooks().stream()
    }

    /// Validate and register a workflow, replacing one with the same id
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<WorkflowId, EngineError> {
        self.engine.validate(&workflow)?;
        let id = workflow.id.clone();
        tracing::info!(workflow_id = %id, "Registered workflow '{}'", workflow.name);
        self.workflows.write().await.insert(id.clone(), Arc::new(workflow));
        Ok(id)
    }

    pub async fn workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.read().await.get(id).cloned()
    }

    pub async fn workflow_ids(&self) -> Vec<WorkflowId> {
        let mut ids: Vec<WorkflowId> = self.workflows.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a registered workflow in the background
    pub async fn start(&self, workflow_id: &str, inputs: Value) -> Result<RunHandle, EngineError> {
        let workflow = self
            .workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        self.spawn(workflow, inputs)
    }

    /// Start an unregistered workflow in the background. Validation errors
    /// are returned here, before anything is spawned.
    pub fn start_workflow(&self, workflow: Workflow, inputs: Value) -> Result<RunHandle, EngineError> {
        self.spawn(Arc::new(workflow), inputs)
    }

    fn spawn(&self, workflow: Arc<Workflow>, inputs: Value) -> Result<RunHandle, EngineError> {
        self.engine.validate(&workflow)?;

        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.active.insert(run_id, cancel.clone());

        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = engine.execute(workflow, inputs, run_id, token).await;
            active.remove(&run_id);
            result
        });

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    /// Run a registered workflow and wait for it
    pub async fn execute_workflow(&self, workflow_id: &str, inputs: Value) -> Result<RunReport, EngineError> {
        self.start(workflow_id, inputs).await?.wait().await
    }

    /// Returns whether the run was active
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.active.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.event_buffer_size, 1000);
        assert!(!config.fail_fast);
    }

    #[test]
    fn config_partial_yaml_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "max_concurrency: 2\nfail_fast: true").unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert!(config.fail_fast);
        assert_eq!(config.event_buffer_size, 1000);
    }

    #[test]
    fn config_json_and_errors() {
        let config =
            RuntimeConfig::parse(r#"{"default_step_timeout_ms": 500}"#, DocumentFormat::Json)
                .unwrap();
        assert_eq!(config.default_step_timeout_ms, Some(500));

        assert!(matches!(
            RuntimeConfig::load("/nonexistent/weave.json"),
            Err(EngineError::Io { .. })
        ));
    }
}

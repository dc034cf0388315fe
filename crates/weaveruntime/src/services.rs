//! Collaborators that step executors delegate to. All of them are handed
//! to executors explicitly when the registry is built.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    NotFound(String),

    #[error("invalid argument '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Runs named tools on behalf of Tool steps
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, tool: &str, inputs: &Map<String, Value>) -> Result<Value, ToolError>;
}

type ToolFn = dyn Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// In-process tool runner backed by closures
#[derive(Clone, Default)]
pub struct ToolBox {
    tools: HashMap<String, Arc<ToolFn>>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, tool: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.tools.insert(name.into(), Arc::new(tool));
    }

    pub fn with_tool<F>(mut self, name: impl Into<String>, tool: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.register(name, tool);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ToolRunner for ToolBox {
    async fn run(&self, tool: &str, inputs: &Map<String, Value>) -> Result<Value, ToolError> {
        let f = self
            .tools
            .get(tool)
            .ok_or_else(|| ToolError::NotFound(tool.to_string()))?;
        f(inputs)
    }
}

/// Acknowledgment returned by a notifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub delivered: bool,
    pub message_id: Option<String>,
    pub recipient: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Sends messages on behalf of Email steps
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<DeliveryStatus, NotifyError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransformError(pub String);

/// Pure value transformation used by DataTransform steps
pub trait Transformer: Send + Sync {
    fn apply(&self, data: &Value, params: &Value) -> Result<Value, TransformError>;
}

impl<F> Transformer for F
where
    F: Fn(&Value, &Value) -> Result<Value, TransformError> + Send + Sync,
{
    fn apply(&self, data: &Value, params: &Value) -> Result<Value, TransformError> {
        self(data, params)
    }
}

#[derive(Clone, Default)]
pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, transformer: impl Transformer + 'static) {
        self.transformers.insert(name.into(), Arc::new(transformer));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Transformer>> {
        self.transformers.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transformers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Inputs visible to a script: exactly the step's resolved inputs
#[derive(Debug, Clone, Default)]
pub struct ScriptScope {
    inputs: Map<String, Value>,
}

impl ScriptScope {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self { inputs }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ScriptError(pub String);

pub trait Script: Send + Sync {
    fn call(&self, scope: &ScriptScope) -> Result<Value, ScriptError>;
}

impl<F> Script for F
where
    F: Fn(&ScriptScope) -> Result<Value, ScriptError> + Send + Sync,
{
    fn call(&self, scope: &ScriptScope) -> Result<Value, ScriptError> {
        self(scope)
    }
}

#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, Arc<dyn Script>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, script: impl Script + 'static) {
        self.scripts.insert(name.into(), Arc::new(script));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Script>> {
        self.scripts.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.scripts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// crates/weaveruntime/src/loader.rs
use crate::engine::EngineError;
use crate::resolver::resolve;
use serde::de::DeserializeOwned;
use std::path::Path;
use weavecore::Workflow;

/// Serialization format of a workflow or config document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// `.yaml`/`.yml` are YAML, everything else JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                DocumentFormat::Yaml
            }
            _ => DocumentFormat::Json,
        }
    }

    pub fn parse<T: DeserializeOwned>(self, src: &str) -> Result<T, String> {
        match self {
            DocumentFormat::Json => serde_json::from_str(src).map_err(|e| e.to_string()),
            DocumentFormat::Yaml => serde_yaml_ng::from_str(src).map_err(|e| e.to_string()),
        }
    }
}

pub(crate) fn read_document(path: &Path) -> Result<(String, DocumentFormat), EngineError> {
    let src = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((src, DocumentFormat::from_path(path)))
}

/// Parse and validate a workflow document
pub fn parse_workflow(src: &str, format: DocumentFormat) -> Result<Workflow, EngineError> {
    let workflow: Workflow = format.parse(src).map_err(|message| EngineError::Parse {
        path: "<inline>".into(),
        message,
    })?;
    resolve(&workflow)?;
    Ok(workflow)
}

/// Load a workflow file, picking JSON or YAML by extension, and validate it
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, EngineError> {
    let path = path.as_ref();
    let (src, format) = read_document(path)?;
    let workflow: Workflow = format.parse(&src).map_err(|message| EngineError::Parse {
        path: path.to_path_buf(),
        message,
    })?;
    resolve(&workflow)?;
    tracing::debug!(
        path = %path.display(),
        steps = workflow.steps.len(),
        "Loaded workflow '{}'",
        workflow.name
    );
    Ok(workflow)
}

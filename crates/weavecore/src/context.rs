//! Run-scoped store of step outputs and the interpolation lookup over it.

use crate::reference::Reference;
use crate::template::Template;
use crate::value::ValueExt;
use crate::workflow::{StepId, INPUT_ROOT};
use crate::{ContextError, StepError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Loop iteration scope: bindings plus outputs published inside it
#[derive(Debug)]
struct Frame {
    bindings: HashMap<String, Value>,
    outputs: DashMap<StepId, Value>,
    parent: Option<Arc<Frame>>,
}

/// Shared output map for one run.
///
/// Cloning is cheap and every clone sees the same outputs. Each step id can
/// be published once per scope; a second publish is rejected.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    outputs: Arc<DashMap<StepId, Value>>,
    inputs: Arc<Value>,
    frame: Option<Arc<Frame>>,
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

impl WorkflowContext {
    pub fn new(inputs: Value) -> Self {
        Self {
            outputs: Arc::new(DashMap::new()),
            inputs: Arc::new(inputs),
            frame: None,
        }
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    /// Child scope for one loop iteration. Lookups fall through to the
    /// enclosing scopes; outputs published here stay here.
    pub fn scoped(&self, bindings: HashMap<String, Value>) -> Self {
        Self {
            outputs: Arc::clone(&self.outputs),
            inputs: Arc::clone(&self.inputs),
            frame: Some(Arc::new(Frame {
                bindings,
                outputs: DashMap::new(),
                parent: self.frame.clone(),
            })),
        }
    }

    pub fn is_scoped(&self) -> bool {
        self.frame.is_some()
    }

    pub fn publish(&self, step: &str, value: Value) -> Result<(), ContextError> {
        let target = match &self.frame {
            Some(frame) => &frame.outputs,
            None => self.outputs.as_ref(),
        };
        match target.entry(step.to_string()) {
            Entry::Occupied(_) => Err(ContextError::AlreadyPublished(step.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Output of a step as seen from this scope
    pub fn get(&self, step: &str) -> Option<Value> {
        let mut frame = self.frame.as_deref();
        while let Some(f) = frame {
            if let Some(v) = f.outputs.get(step) {
                return Some(v.value().clone());
            }
            frame = f.parent.as_deref();
        }
        self.outputs.get(step).map(|v| v.value().clone())
    }

    pub fn contains(&self, step: &str) -> bool {
        self.get(step).is_some()
    }

    fn root_value(&self, root: &str) -> Option<Value> {
        let mut frame = self.frame.as_deref();
        while let Some(f) = frame {
            if let Some(v) = f.bindings.get(root) {
                return Some(v.clone());
            }
            if let Some(v) = f.outputs.get(root) {
                return Some(v.value().clone());
            }
            frame = f.parent.as_deref();
        }
        if let Some(v) = self.outputs.get(root) {
            return Some(v.value().clone());
        }
        (root == INPUT_ROOT).then(|| self.inputs.as_ref().clone())
    }

    pub fn resolve(&self, reference: &Reference) -> Result<Value, StepError> {
        let root = self
            .root_value(&reference.root)
            .ok_or_else(|| StepError::VariableResolution {
                reference: reference.to_string(),
                reason: format!("no output published for '{}'", reference.root),
            })?;
        root.at_path(&reference.path)
            .cloned()
            .ok_or_else(|| StepError::VariableResolution {
                reference: reference.to_string(),
                reason: format!("path not found in {} value", root.kind_name()),
            })
    }

    pub fn resolve_template(&self, template: &Template) -> Result<Value, StepError> {
        template.render_with(&|r: &Reference| self.resolve(r))
    }

    /// Resolve every input expression of a step into concrete values
    pub fn resolve_inputs(&self, inputs: &BTreeMap<String, Value>) -> Result<Map<String, Value>, StepError> {
        let mut resolved = Map::new();
        for (name, raw) in inputs {
            let template = Template::parse(raw).map_err(|e| StepError::VariableResolution {
                reference: raw.render(),
                reason: e.to_string(),
            })?;
            resolved.insert(name.clone(), self.resolve_template(&template)?);
        }
        Ok(resolved)
    }

    /// Top-level outputs published so far
    pub fn snapshot(&self) -> BTreeMap<StepId, Value> {
        self.outputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_once() {
        let ctx = WorkflowContext::default();
        ctx.publish("A", json!(1)).unwrap();
        assert_eq!(
            ctx.publish("A", json!(2)),
            Err(ContextError::AlreadyPublished("A".into()))
        );
        assert_eq!(ctx.get("A"), Some(json!(1)));
    }

    #[test]
    fn test_clones_share_outputs() {
        let ctx = WorkflowContext::default();
        let other = ctx.clone();
        other.publish("B", json!({"value": 3})).unwrap();
        assert_eq!(ctx.resolve(&"$B.value".parse().unwrap()).unwrap(), json!(3));
    }

    #[test]
    fn test_run_inputs_root() {
        let ctx = WorkflowContext::new(json!({"user": {"id": 7}}));
        let r = Reference::new(INPUT_ROOT).field("user").field("id");
        assert_eq!(ctx.resolve(&r).unwrap(), json!(7));
    }

    #[test]
    fn test_missing_root_and_path() {
        let ctx = WorkflowContext::default();
        ctx.publish("A", json!({"x": 1})).unwrap();
        let err = ctx.resolve(&Reference::new("nope")).unwrap_err();
        assert!(matches!(err, StepError::VariableResolution { .. }));
        let err = ctx.resolve(&Reference::new("A").field("y")).unwrap_err();
        assert!(err.to_string().contains("$A.y"), "got: {err}");
    }

    #[test]
    fn test_scoped_bindings_and_isolation() {
        let ctx = WorkflowContext::default();
        ctx.publish("A", json!([10, 20])).unwrap();

        let first = ctx.scoped(HashMap::from([("item".to_string(), json!(10))]));
        let second = ctx.scoped(HashMap::from([("item".to_string(), json!(20))]));
        first.publish("body", json!("one")).unwrap();
        second.publish("body", json!("two")).unwrap();

        assert_eq!(first.resolve(&Reference::new("item")).unwrap(), json!(10));
        assert_eq!(second.get("body"), Some(json!("two")));
        assert_eq!(first.resolve(&Reference::new("A").index(1)).unwrap(), json!(20));
        assert!(ctx.get("body").is_none());
        assert!(ctx.resolve(&Reference::new("item")).is_err());
        assert!(first.is_scoped() && !ctx.is_scoped());
    }

    #[test]
    fn test_resolve_inputs() {
        let ctx = WorkflowContext::default();
        ctx.publish("A", json!({"name": "weave"})).unwrap();
        let inputs = BTreeMap::from([
            ("greeting".to_string(), json!("hi ${A.name}")),
            ("raw".to_string(), json!(5)),
        ]);
        let resolved = ctx.resolve_inputs(&inputs).unwrap();
        assert_eq!(resolved["greeting"], json!("hi weave"));
        assert_eq!(resolved["raw"], json!(5));
        assert_eq!(ctx.snapshot().len(), 1);
    }
}

use crate::expression::Expression;
use crate::reference::{is_ident_char, Reference, ReferenceError};
use crate::template::Template;
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = String;
pub type StepId = String;

/// Reference root under which the run's initial inputs are visible
pub const INPUT_ROOT: &str = "input";

/// Step ids that would shadow a built-in reference root
pub const RESERVED_IDS: &[&str] = &[INPUT_ROOT];

/// Complete workflow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "generate_id")]
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn generate_id() -> WorkflowId {
    Uuid::new_v4().to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            description: None,
            version: default_version(),
            steps: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_step(&mut self, step: WorkflowStep) -> StepId {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    pub fn find_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in declaration order
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Map of nested step id to the Parallel or Loop step that owns it
    pub fn owners(&self) -> HashMap<&str, &str> {
        let mut owners = HashMap::new();
        for step in &self.steps {
            for child in step.kind.nested_steps() {
                owners.entry(child.as_str()).or_insert(step.id.as_str());
            }
        }
        owners
    }

    /// Every step nested under `id`, at any depth
    pub fn descendants(&self, id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(step) = self.find_step(current) else {
                continue;
            };
            for child in step.kind.nested_steps() {
                if child != id && !out.contains(&child.as_str()) {
                    out.push(child);
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Steps the engine schedules itself, in declaration order
    pub fn top_level_steps(&self) -> Vec<&WorkflowStep> {
        let owners = self.owners();
        self.steps
            .iter()
            .filter(|s| !owners.contains_key(s.id.as_str()))
            .collect()
    }

    /// Loop bindings visible to a step: those of every enclosing loop
    pub fn scope_bindings(&self, id: &str) -> HashSet<&str> {
        let owners = self.owners();
        let mut bindings = HashSet::new();
        let mut current = id;
        let mut guard = 0;
        while let Some(owner) = owners.get(current) {
            if let Some(StepKind::Loop {
                item_var,
                index_var,
                ..
            }) = self.find_step(owner).map(|s| &s.kind)
            {
                bindings.insert(item_var.as_str());
                bindings.insert(index_var.as_str());
            }
            current = owner;
            guard += 1;
            if guard > self.steps.len() {
                break;
            }
        }
        bindings
    }

    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }

    /// Structural validation of the definition itself: ids, input
    /// contracts, expression syntax and nesting rules. Graph properties
    /// (cycles, dangling `depends_on`) are checked by the resolver.
    pub fn validate_shape(&self) -> Result<(), ValidationError> {
        if self.steps.is_empty() {
            return Err(ValidationError::EmptyWorkflow(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ValidationError::DuplicateStepId(step.id.clone()));
            }
            step.validate_shape()?;
        }

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for step in &self.steps {
            for child in step.kind.nested_steps() {
                if !seen.contains(child.as_str()) {
                    return Err(ValidationError::UnknownStepReference {
                        step: step.id.clone(),
                        reference: child.clone(),
                    });
                }
                if child == &step.id {
                    return Err(invalid(&step.id, "a step cannot nest itself"));
                }
                if let Some(previous) = owners.insert(child.as_str(), step.id.as_str()) {
                    if previous != step.id {
                        return Err(invalid(
                            child,
                            format!("nested in both '{}' and '{}'", previous, step.id),
                        ));
                    }
                }
            }
        }

        for step in &self.steps {
            if owners.contains_key(step.id.as_str()) && !step.depends_on.is_empty() {
                return Err(invalid(
                    &step.id,
                    "nested steps run inside their owner and cannot declare depends_on",
                ));
            }
            if owners.contains_key(step.id.as_str()) && step.when.is_some() {
                return Err(invalid(&step.id, "a nested step cannot carry a when guard"));
            }
            for dep in &step.depends_on {
                if let Some(owner) = owners.get(dep.as_str()) {
                    return Err(invalid(
                        &step.id,
                        format!("depends on nested step '{}'; depend on '{}' instead", dep, owner),
                    ));
                }
            }
            if let StepKind::Condition { then, otherwise, .. } = &step.kind {
                for branch in then.iter().chain(otherwise.iter()) {
                    let target = self.find_step(branch).ok_or_else(|| {
                        ValidationError::UnknownStepReference {
                            step: step.id.clone(),
                            reference: branch.clone(),
                        }
                    })?;
                    if owners.contains_key(branch.as_str()) {
                        return Err(invalid(branch, "a nested step cannot be a condition branch"));
                    }
                    if !target.depends_on.contains(&step.id) {
                        return Err(invalid(
                            branch,
                            format!("branch of condition '{}' must depend on it", step.id),
                        ));
                    }
                }
                if let Some(both) = then.iter().find(|b| otherwise.contains(b)) {
                    return Err(invalid(
                        both,
                        format!("listed in both branches of '{}'", step.id),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn invalid(step: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidStep {
        step: step.to_string(),
        reason: reason.into(),
    }
}

/// Step specification in a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Input name to literal value or interpolation expression
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepId>,
    /// Guard expression; a ready step whose guard is false is skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Failure of this step does not fail the run
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Run even when a dependency failed or was skipped
    #[serde(default)]
    pub tolerate_upstream_failure: bool,
}

impl WorkflowStep {
    pub fn new(id: impl Into<StepId>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            kind,
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
            when: None,
            retry: None,
            timeout_ms: None,
            continue_on_failure: false,
            tolerate_upstream_failure: false,
        }
    }

    pub fn tool(id: impl Into<StepId>, tool: impl Into<String>) -> Self {
        Self::new(id, StepKind::Tool { tool: tool.into() })
    }

    pub fn condition(
        id: impl Into<StepId>,
        expression: impl Into<String>,
        then: &[&str],
        otherwise: &[&str],
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition {
                expression: expression.into(),
                then: then.iter().map(|s| s.to_string()).collect(),
                otherwise: otherwise.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn parallel(id: impl Into<StepId>, children: &[&str]) -> Self {
        Self::new(
            id,
            StepKind::Parallel {
                children: children.iter().map(|s| s.to_string()).collect(),
                on_child_failure: ChildFailurePolicy::default(),
            },
        )
    }

    pub fn loop_over(id: impl Into<StepId>, items: impl Into<Value>, body: impl Into<StepId>) -> Self {
        Self::new(
            id,
            StepKind::Loop {
                body: body.into(),
                item_var: default_item_var(),
                index_var: default_index_var(),
                mode: LoopMode::default(),
                max_iterations: None,
                on_item_failure: ChildFailurePolicy::default(),
            },
        )
        .with_input("items", items)
    }

    pub fn transform(id: impl Into<StepId>, transform: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(
            id,
            StepKind::DataTransform {
                transform: transform.into(),
                params: Value::Null,
            },
        )
        .with_input("data", data)
    }

    pub fn delay(id: impl Into<StepId>, duration_ms: u64) -> Self {
        Self::new(id, StepKind::Delay).with_input("duration_ms", duration_ms)
    }

    pub fn script(id: impl Into<StepId>, script: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::Script {
                script: script.into(),
            },
        )
    }

    pub fn webhook(id: impl Into<StepId>, url: impl Into<Value>) -> Self {
        Self::new(
            id,
            StepKind::Webhook {
                method: default_method(),
                headers: BTreeMap::new(),
                expect_success: true,
            },
        )
        .with_input("url", url)
    }

    pub fn email(
        id: impl Into<StepId>,
        to: impl Into<Value>,
        subject: impl Into<Value>,
        body: impl Into<Value>,
    ) -> Self {
        Self::new(id, StepKind::Email)
            .with_input("to", to)
            .with_input("subject", subject)
            .with_input("body", body)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn depends_on(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_when(mut self, guard: impl Into<String>) -> Self {
        self.when = Some(guard.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
            max_delay_ms: None,
        });
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    pub fn tolerate_upstream_failure(mut self) -> Self {
        self.tolerate_upstream_failure = true;
        self
    }

    /// Transformer parameters; ignored for other kinds
    pub fn with_params(mut self, value: impl Into<Value>) -> Self {
        if let StepKind::DataTransform { params, .. } = &mut self.kind {
            *params = value.into();
        }
        self
    }

    /// Sibling policy for Parallel children or Loop items
    pub fn with_child_failure(mut self, policy: ChildFailurePolicy) -> Self {
        match &mut self.kind {
            StepKind::Parallel {
                on_child_failure, ..
            } => *on_child_failure = policy,
            StepKind::Loop {
                on_item_failure, ..
            } => *on_item_failure = policy,
            _ => {}
        }
        self
    }

    pub fn with_loop_mode(mut self, loop_mode: LoopMode) -> Self {
        if let StepKind::Loop { mode, .. } = &mut self.kind {
            *mode = loop_mode;
        }
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        if let StepKind::Loop { max_iterations, .. } = &mut self.kind {
            *max_iterations = Some(max);
        }
        self
    }

    pub fn with_method(mut self, value: impl Into<String>) -> Self {
        if let StepKind::Webhook { method, .. } = &mut self.kind {
            *method = value.into();
        }
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Every interpolation reference the step makes, from its inputs, its
    /// guard and, for conditions, its expression.
    pub fn references(&self) -> Result<Vec<Reference>, ReferenceError> {
        let mut refs = Vec::new();
        for value in self.inputs.values() {
            refs.extend(Template::parse(value)?.references().into_iter().cloned());
        }
        let expression = match &self.kind {
            StepKind::Condition { expression, .. } => Some(expression),
            _ => None,
        };
        // Syntax errors are reported by validate_shape
        for src in self.when.iter().chain(expression) {
            if let Ok(expr) = Expression::parse(src) {
                refs.extend(expr.references().into_iter().cloned());
            }
        }
        Ok(refs)
    }

    fn validate_shape(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() || !self.id.chars().all(is_ident_char) {
            return Err(invalid(
                &self.id,
                "ids may only contain ASCII letters, digits, '_' and '-'",
            ));
        }
        if RESERVED_IDS.contains(&self.id.as_str()) {
            return Err(invalid(&self.id, "id is reserved"));
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(invalid(&self.id, "retry.max_attempts must be at least 1"));
            }
        }

        let tag = self.kind.tag();
        for slot in tag.input_contract() {
            if slot.required && !self.inputs.contains_key(slot.name) {
                return Err(invalid(
                    &self.id,
                    format!("{} step requires input '{}'", tag, slot.name),
                ));
            }
        }
        if !tag.accepts_extra_inputs() {
            if let Some(extra) = self
                .inputs
                .keys()
                .find(|name| !tag.input_contract().iter().any(|slot| slot.name == name.as_str()))
            {
                return Err(invalid(
                    &self.id,
                    format!("{} step does not accept input '{}'", tag, extra),
                ));
            }
        }

        for (name, value) in &self.inputs {
            Template::parse(value)
                .map_err(|e| invalid(&self.id, format!("input '{}': {}", name, e)))?;
        }
        if let Some(guard) = &self.when {
            Expression::parse(guard).map_err(|e| invalid(&self.id, format!("when: {}", e)))?;
        }

        match &self.kind {
            StepKind::Tool { tool } if tool.is_empty() => {
                Err(invalid(&self.id, "tool name is empty"))
            }
            StepKind::Condition { expression, .. } => Expression::parse(expression)
                .map(|_| ())
                .map_err(|e| invalid(&self.id, format!("condition: {}", e))),
            StepKind::Parallel { children, .. } if children.is_empty() => {
                Err(invalid(&self.id, "parallel step has no children"))
            }
            StepKind::Loop {
                item_var,
                index_var,
                ..
            } if item_var == index_var || item_var.is_empty() || index_var.is_empty() => Err(
                invalid(&self.id, "loop item_var and index_var must be distinct and non-empty"),
            ),
            StepKind::DataTransform { transform, .. } if transform.is_empty() => {
                Err(invalid(&self.id, "transform name is empty"))
            }
            StepKind::Script { script } if script.is_empty() => {
                Err(invalid(&self.id, "script name is empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Step kind with its kind-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Tool {
        tool: String,
    },
    Condition {
        expression: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        then: Vec<StepId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<StepId>,
    },
    Parallel {
        children: Vec<StepId>,
        #[serde(default)]
        on_child_failure: ChildFailurePolicy,
    },
    Loop {
        body: StepId,
        #[serde(default = "default_item_var")]
        item_var: String,
        #[serde(default = "default_index_var")]
        index_var: String,
        #[serde(default)]
        mode: LoopMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
        #[serde(default)]
        on_item_failure: ChildFailurePolicy,
    },
    DataTransform {
        transform: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        params: Value,
    },
    Delay,
    Script {
        script: String,
    },
    Webhook {
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_true")]
        expect_success: bool,
    },
    Email,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_index_var() -> String {
    "index".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

impl StepKind {
    pub fn tag(&self) -> StepKindTag {
        match self {
            StepKind::Tool { .. } => StepKindTag::Tool,
            StepKind::Condition { .. } => StepKindTag::Condition,
            StepKind::Parallel { .. } => StepKindTag::Parallel,
            StepKind::Loop { .. } => StepKindTag::Loop,
            StepKind::DataTransform { .. } => StepKindTag::DataTransform,
            StepKind::Delay => StepKindTag::Delay,
            StepKind::Script { .. } => StepKindTag::Script,
            StepKind::Webhook { .. } => StepKindTag::Webhook,
            StepKind::Email => StepKindTag::Email,
        }
    }

    /// Steps this step dispatches itself
    pub fn nested_steps(&self) -> Vec<&StepId> {
        match self {
            StepKind::Parallel { children, .. } => children.iter().collect(),
            StepKind::Loop { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    pub fn output_name(&self) -> &'static str {
        self.tag().output_name()
    }

    pub fn input_contract(&self) -> &'static [InputSlot] {
        self.tag().input_contract()
    }
}

/// Discriminant of [`StepKind`], used as the executor lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKindTag {
    Tool,
    Condition,
    Parallel,
    Loop,
    DataTransform,
    Delay,
    Script,
    Webhook,
    Email,
}

/// A named input in a step kind's contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

const fn slot(name: &'static str, required: bool, description: &'static str) -> InputSlot {
    InputSlot {
        name,
        required,
        description,
    }
}

impl StepKindTag {
    pub const ALL: [StepKindTag; 9] = [
        StepKindTag::Tool,
        StepKindTag::Condition,
        StepKindTag::Parallel,
        StepKindTag::Loop,
        StepKindTag::DataTransform,
        StepKindTag::Delay,
        StepKindTag::Script,
        StepKindTag::Webhook,
        StepKindTag::Email,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepKindTag::Tool => "tool",
            StepKindTag::Condition => "condition",
            StepKindTag::Parallel => "parallel",
            StepKindTag::Loop => "loop",
            StepKindTag::DataTransform => "data_transform",
            StepKindTag::Delay => "delay",
            StepKindTag::Script => "script",
            StepKindTag::Webhook => "webhook",
            StepKindTag::Email => "email",
        }
    }

    /// Name of the single output each kind produces
    pub fn output_name(self) -> &'static str {
        match self {
            StepKindTag::Tool | StepKindTag::Script => "result",
            StepKindTag::Condition => "matched",
            StepKindTag::Parallel | StepKindTag::Loop => "results",
            StepKindTag::DataTransform => "value",
            StepKindTag::Delay => "delay",
            StepKindTag::Webhook => "response",
            StepKindTag::Email => "delivery",
        }
    }

    pub fn input_contract(self) -> &'static [InputSlot] {
        const LOOP: &[InputSlot] = &[slot("items", true, "collection to iterate")];
        const TRANSFORM: &[InputSlot] = &[slot("data", true, "value to transform")];
        const DELAY: &[InputSlot] = &[slot("duration_ms", true, "milliseconds to wait")];
        const WEBHOOK: &[InputSlot] = &[
            slot("url", true, "request URL"),
            slot("body", false, "JSON request body"),
            slot("headers", false, "extra request headers"),
        ];
        const EMAIL: &[InputSlot] = &[
            slot("to", true, "recipient"),
            slot("subject", true, "subject line"),
            slot("body", true, "message body"),
        ];
        match self {
            StepKindTag::Loop => LOOP,
            StepKindTag::DataTransform => TRANSFORM,
            StepKindTag::Delay => DELAY,
            StepKindTag::Webhook => WEBHOOK,
            StepKindTag::Email => EMAIL,
            StepKindTag::Tool
            | StepKindTag::Condition
            | StepKindTag::Parallel
            | StepKindTag::Script => &[],
        }
    }

    /// Tool and Script forward arbitrary named inputs
    pub fn accepts_extra_inputs(self) -> bool {
        matches!(self, StepKindTag::Tool | StepKindTag::Script)
    }
}

impl fmt::Display for StepKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to siblings when one child of a Parallel or Loop fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildFailurePolicy {
    #[default]
    FinishSiblings,
    AbortSiblings,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Sequential,
    Parallel,
}

/// Retry policy for step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: None,
        }
    }
}

impl RetryPolicy {
    /// A single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait before the attempt following failed attempt number `failed`
    /// (1-based): `delay_ms * multiplier^(failed - 1)`, capped.
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1) as i32;
        let mut ms = self.delay_ms as f64 * self.backoff_multiplier.max(0.0).powi(exponent);
        if let Some(cap) = self.max_delay_ms {
            ms = ms.min(cap as f64);
        }
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Branches not downstream of a failed step keep running
    #[default]
    ContinueIndependent,
    /// The first required failure skips every step not yet started
    FailFast,
}

//! Input expressions: literal values with embedded interpolation references.
//!
//! A string that is exactly `$ref` resolves to the referenced value with its
//! original type. A string containing `${ref}` segments is rendered as text.
//! A leading `$$` escapes a literal dollar. Arrays and objects are resolved
//! element by element.

use crate::reference::{Reference, ReferenceError};
use crate::value::ValueExt;
use crate::StepError;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum TextPart {
    Literal(String),
    Reference(Reference),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Literal(Value),
    Reference(Reference),
    Text(Vec<TextPart>),
    List(Vec<Template>),
    Map(Vec<(String, Template)>),
}

impl Template {
    pub fn parse(value: &Value) -> Result<Self, ReferenceError> {
        match value {
            Value::String(s) => Self::parse_str(s),
            Value::Array(items) => {
                let parsed = items
                    .iter()
                    .map(Self::parse)
                    .collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(Template::is_literal) {
                    Ok(Template::Literal(value.clone()))
                } else {
                    Ok(Template::List(parsed))
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Self::parse(v)?)))
                    .collect::<Result<Vec<_>, ReferenceError>>()?;
                if parsed.iter().all(|(_, t)| t.is_literal()) {
                    Ok(Template::Literal(value.clone()))
                } else {
                    Ok(Template::Map(parsed))
                }
            }
            other => Ok(Template::Literal(other.clone())),
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, ReferenceError> {
        if let Some(rest) = s.strip_prefix("$$") {
            return Ok(Template::Literal(Value::String(format!("${}", rest))));
        }
        if s.starts_with('$') && !s.starts_with("${") {
            return Ok(Template::Reference(Reference::parse(s)?));
        }
        if !s.contains("${") {
            return Ok(Template::Literal(Value::String(s.to_string())));
        }

        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut rest = s;
        while let Some(start) = rest.find("${") {
            literal.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| ReferenceError::Unterminated(s.to_string()))?;
            if !literal.is_empty() {
                parts.push(TextPart::Literal(std::mem::take(&mut literal)));
            }
            parts.push(TextPart::Reference(Reference::parse(after[..end].trim())?));
            rest = &after[end + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            parts.push(TextPart::Literal(literal));
        }
        Ok(Template::Text(parts))
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Template::Literal(_))
    }

    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Template::Literal(_) => {}
            Template::Reference(r) => out.push(r),
            Template::Text(parts) => out.extend(parts.iter().filter_map(|p| match p {
                TextPart::Reference(r) => Some(r),
                TextPart::Literal(_) => None,
            })),
            Template::List(items) => items.iter().for_each(|t| t.collect_references(out)),
            Template::Map(entries) => entries.iter().for_each(|(_, t)| t.collect_references(out)),
        }
    }

    /// Produce a concrete value, looking references up through `lookup`
    pub fn render_with<F>(&self, lookup: &F) -> Result<Value, StepError>
    where
        F: Fn(&Reference) -> Result<Value, StepError>,
    {
        match self {
            Template::Literal(v) => Ok(v.clone()),
            Template::Reference(r) => lookup(r),
            Template::Text(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TextPart::Literal(s) => out.push_str(s),
                        TextPart::Reference(r) => out.push_str(&lookup(r)?.render()),
                    }
                }
                Ok(Value::String(out))
            }
            Template::List(items) => items
                .iter()
                .map(|t| t.render_with(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Template::Map(entries) => {
                let mut map = Map::new();
                for (key, t) in entries {
                    map.insert(key.clone(), t.render_with(lookup)?);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

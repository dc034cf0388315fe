//! Built-in transformers available to DataTransform steps.
//!
//! | name         | data           | params                                        |
//! |--------------|----------------|-----------------------------------------------|
//! | `map`        | array          | `{"field": "a.b"}`                            |
//! | `filter`     | array          | `{"field": "a", "op": ">", "value": 1}`       |
//! | `format`     | any            | `{"template": "Hi {name}"}`                   |
//! | `pick`       | object         | `{"fields": ["a", "b"]}`                      |
//! | `upper`      | string         |                                               |
//! | `lower`      | string         |                                               |
//! | `length`     | array/string/object |                                          |
//! | `parse_json` | string         |                                               |
//! | `to_json`    | any            | `{"pretty": true}`                            |

use serde_json::{Map, Value};
use weavecore::{CompareOp, PathSegment, ValueExt};
use weaveruntime::{TransformError, TransformerRegistry};

pub fn builtin_transformers() -> TransformerRegistry {
    let mut registry = TransformerRegistry::new();
    registry.register("map", map);
    registry.register("filter", filter);
    registry.register("format", format);
    registry.register("pick", pick);
    registry.register("upper", upper);
    registry.register("lower", lower);
    registry.register("length", length);
    registry.register("parse_json", parse_json);
    registry.register("to_json", to_json);
    registry
}

fn err(message: impl Into<String>) -> TransformError {
    TransformError(message.into())
}

fn expect_array<'a>(data: &'a Value) -> Result<&'a Vec<Value>, TransformError> {
    data.as_array()
        .ok_or_else(|| err(format!("expected an array, got {}", data.kind_name())))
}

fn expect_str(data: &Value) -> Result<&str, TransformError> {
    data.as_str()
        .ok_or_else(|| err(format!("expected a string, got {}", data.kind_name())))
}

fn field_path(params: &Value) -> Result<Vec<PathSegment>, TransformError> {
    let field = params
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| err("params.field is required"))?;
    Ok(field
        .split('.')
        .filter(|s| !s.is_empty())
        .map(|s| PathSegment::Field(s.to_string()))
        .collect())
}

fn map(data: &Value, params: &Value) -> Result<Value, TransformError> {
    let path = field_path(params)?;
    let items = expect_array(data)?;
    Ok(Value::Array(
        items
            .iter()
            .map(|item| item.at_path(&path).cloned().unwrap_or(Value::Null))
            .collect(),
    ))
}

/// Keeps items whose field is truthy, or compares with `op`/`value`
fn filter(data: &Value, params: &Value) -> Result<Value, TransformError> {
    let path = field_path(params)?;
    let items = expect_array(data)?;
    let comparison = match params.get("value") {
        Some(expected) => {
            let symbol = params.get("op").and_then(Value::as_str).unwrap_or("==");
            let op = CompareOp::from_symbol(symbol)
                .ok_or_else(|| err(format!("unknown operator '{}'", symbol)))?;
            Some((op, expected))
        }
        None => None,
    };

    let mut kept = Vec::new();
    for item in items {
        let value = item.at_path(&path).unwrap_or(&Value::Null);
        let keep = match comparison {
            Some((op, expected)) => op.apply(value, expected).unwrap_or(false),
            None => value.is_truthy(),
        };
        if keep {
            kept.push(item.clone());
        }
    }
    Ok(Value::Array(kept))
}

/// `{key}` placeholders are filled from an object; `{}` takes the whole value
fn format(data: &Value, params: &Value) -> Result<Value, TransformError> {
    let template = params
        .get("template")
        .and_then(Value::as_str)
        .ok_or_else(|| err("params.template is required"))?;

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| err(format!("unclosed '{{' in template '{}'", template)))?;
        let key = after[..close].trim();
        let value = if key.is_empty() {
            Some(data)
        } else {
            data.get(key)
        };
        out.push_str(&value.map(ValueExt::render).unwrap_or_default());
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn pick(data: &Value, params: &Value) -> Result<Value, TransformError> {
    let object = data
        .as_object()
        .ok_or_else(|| err(format!("expected an object, got {}", data.kind_name())))?;
    let fields = params
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| err("params.fields must be an array of names"))?;

    let mut picked = Map::new();
    for field in fields.iter().filter_map(Value::as_str) {
        if let Some(v) = object.get(field) {
            picked.insert(field.to_string(), v.clone());
        }
    }
    Ok(Value::Object(picked))
}

fn upper(data: &Value, _: &Value) -> Result<Value, TransformError> {
    Ok(Value::String(expect_str(data)?.to_uppercase()))
}

fn lower(data: &Value, _: &Value) -> Result<Value, TransformError> {
    Ok(Value::String(expect_str(data)?.to_lowercase()))
}

fn length(data: &Value, _: &Value) -> Result<Value, TransformError> {
    let n = match data {
        Value::Array(items) => items.len(),
        Value::String(s) => s.chars().count(),
        Value::Object(map) => map.len(),
        other => return Err(err(format!("{} has no length", other.kind_name()))),
    };
    Ok(Value::from(n))
}

fn parse_json(data: &Value, _: &Value) -> Result<Value, TransformError> {
    serde_json::from_str(expect_str(data)?).map_err(|e| err(format!("invalid JSON: {}", e)))
}

fn to_json(data: &Value, params: &Value) -> Result<Value, TransformError> {
    let pretty = params.get("pretty").and_then(Value::as_bool).unwrap_or(false);
    let text = if pretty {
        serde_json::to_string_pretty(data)
    } else {
        serde_json::to_string(data)
    };
    text.map(Value::String).map_err(|e| err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(name: &str, data: Value, params: Value) -> Result<Value, TransformError> {
        builtin_transformers().get(name).unwrap().apply(&data, &params)
    }

    #[test]
    fn test_registry_names() {
        assert_eq!(
            builtin_transformers().names(),
            vec!["filter", "format", "length", "lower", "map", "parse_json", "pick", "to_json", "upper"]
        );
    }

    #[test]
    fn test_map_and_filter() {
        let users = json!([{"name": "a", "age": 30}, {"name": "b", "age": 12}, {"name": "c"}]);
        assert_eq!(
            apply("map", users.clone(), json!({"field": "name"})).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            apply("filter", users.clone(), json!({"field": "age", "op": ">=", "value": 18})).unwrap(),
            json!([{"name": "a", "age": 30}])
        );
        assert_eq!(apply("filter", users, json!({"field": "age"})).unwrap().as_array().unwrap().len(), 2);
        assert!(apply("map", json!("nope"), json!({"field": "x"})).is_err());
    }

    #[test]
    fn test_format_and_pick() {
        let user = json!({"name": "Ada", "age": 36, "email": "ada@example.com"});
        assert_eq!(
            apply("format", user.clone(), json!({"template": "{name} is {age}"})).unwrap(),
            json!("Ada is 36")
        );
        assert_eq!(
            apply("format", json!(5), json!({"template": "n={}"})).unwrap(),
            json!("n=5")
        );
        assert_eq!(
            apply("pick", user, json!({"fields": ["name", "missing"]})).unwrap(),
            json!({"name": "Ada"})
        );
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(apply("upper", json!("abc"), Value::Null).unwrap(), json!("ABC"));
        assert_eq!(apply("lower", json!("ABC"), Value::Null).unwrap(), json!("abc"));
        assert_eq!(apply("length", json!("héllo"), Value::Null).unwrap(), json!(5));
        assert_eq!(apply("length", json!([1, 2]), Value::Null).unwrap(), json!(2));
        assert!(apply("length", json!(3), Value::Null).is_err());
    }

    #[test]
    fn test_json_round_trip_helpers() {
        assert_eq!(
            apply("parse_json", json!(r#"{"a":[1,2]}"#), Value::Null).unwrap(),
            json!({"a": [1, 2]})
        );
        assert_eq!(apply("to_json", json!({"a": 1}), Value::Null).unwrap(), json!(r#"{"a":1}"#));
        assert!(apply("parse_json", json!("{oops"), Value::Null).is_err());
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let data = json!(["x", "y"]);
        let before = data.clone();
        let _ = builtin_transformers()
            .get("to_json")
            .unwrap()
            .apply(&data, &Value::Null)
            .unwrap();
        assert_eq!(data, before);
    }
}

use crate::reference::PathSegment;
use serde_json::Value;
use std::cmp::Ordering;

/// Helpers over the dynamic value type shared by step inputs and outputs
pub trait ValueExt {
    /// `null`, `false`, `0`, `""`, `[]` and `{}` are falsy
    fn is_truthy(&self) -> bool;

    /// Short type name used in error messages
    fn kind_name(&self) -> &'static str;

    /// Walk a field/index path. Numeric field names also index arrays.
    fn at_path(&self, path: &[PathSegment]) -> Option<&Value>;

    /// Text form used by string interpolation: strings are inserted raw,
    /// everything else as compact JSON.
    fn render(&self) -> String;
}

impl ValueExt for Value {
    fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn at_path(&self, path: &[PathSegment]) -> Option<&Value> {
        path.iter().try_fold(self, |current, segment| match (segment, current) {
            (PathSegment::Field(name), Value::Object(map)) => map.get(name),
            (PathSegment::Field(name), Value::Array(items)) => {
                name.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        })
    }

    fn render(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Equality that treats `10` and `10.0` as the same number
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

/// Ordering between two values, if they are comparable.
///
/// Numbers compare numerically (a numeric string compared against a number
/// is parsed first), strings lexically, booleans `false < true`.
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            let a = as_number(left)?;
            let b = as_number(right)?;
            a.partial_cmp(&b)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!json!(null).is_truthy());
        assert!(!json!(0).is_truthy());
        assert!(!json!("").is_truthy());
        assert!(!json!([]).is_truthy());
        assert!(json!(0.5).is_truthy());
        assert!(json!({"a": 1}).is_truthy());
    }

    #[test]
    fn test_at_path() {
        let value = json!({"items": [{"name": "a"}, {"name": "b"}]});
        let path = vec![
            PathSegment::Field("items".into()),
            PathSegment::Index(1),
            PathSegment::Field("name".into()),
        ];
        assert_eq!(value.at_path(&path), Some(&json!("b")));

        let dotted = vec![PathSegment::Field("items".into()), PathSegment::Field("0".into())];
        assert_eq!(value.at_path(&dotted), Some(&json!({"name": "a"})));

        let missing = vec![PathSegment::Field("nope".into())];
        assert_eq!(value.at_path(&missing), None);
    }

    #[test]
    fn test_compare_mixed_numbers() {
        assert_eq!(compare(&json!(12), &json!(10)), Some(Ordering::Greater));
        assert_eq!(compare(&json!("12"), &json!(10)), Some(Ordering::Greater));
        assert_eq!(compare(&json!("abc"), &json!(10)), None);
        assert!(loose_eq(&json!(10), &json!(10.0)));
    }
}

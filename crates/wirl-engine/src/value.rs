//! The dynamic channel value and reducer application.
//!
//! WIRL channel values are the tagged variant from spec.md §9 — `null`,
//! `bool`, `int`/`float`, `string`, `list`, `map`. `serde_json::Value` already
//! is exactly that variant, so the engine uses it directly as the channel
//! representation instead of introducing a parallel enum.

use serde_json::Value;
use wirl_dsl::ast::{Literal, ReducerKind};

/// Converts a compile-time literal into the dynamic channel representation.
pub fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(i) => Value::Number((*i).into()),
        Literal::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Literal::Str(s) => Value::String(s.clone()),
        Literal::List(items) => Value::Array(items.iter().map(literal_to_value).collect()),
        Literal::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), literal_to_value(v)))
                .collect(),
        ),
    }
}

/// A reducer was applied to a value shape it does not support, e.g. `append`
/// on a non-list, or `merge` on a non-object.
///
/// Always `retryable = false`: a shape mismatch is deterministic given the
/// same inputs and will not resolve itself on a bare re-run.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[error("reducer error on channel '{channel}': {message}")]
pub struct ReducerError {
    pub channel: String,
    pub message: String,
    pub retryable: bool,
}

impl ReducerError {
    fn new(channel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Combines `write` with the channel's prior value (if any) per `kind`.
///
/// `replace` always wins with `write`. `append` concatenates (a bare value is
/// treated as a singleton list). `merge` performs a shallow key-wise merge of
/// two objects, with `write`'s keys winning on conflict.
pub fn apply_reducer(
    channel: &str,
    existing: Option<&Value>,
    write: Value,
    kind: ReducerKind,
) -> Result<Value, ReducerError> {
    match kind {
        ReducerKind::Replace => Ok(write),
        ReducerKind::Append => {
            let mut base = match existing {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(other) => {
                    return Err(ReducerError::new(
                        channel,
                        format!("append reducer requires a list, found {}", type_name(other)),
                    ))
                }
            };
            match write {
                Value::Array(items) => base.extend(items),
                other => base.push(other),
            }
            Ok(Value::Array(base))
        }
        ReducerKind::Merge => {
            let mut base = match existing {
                None | Some(Value::Null) => serde_json::Map::new(),
                Some(Value::Object(map)) => map.clone(),
                Some(other) => {
                    return Err(ReducerError::new(
                        channel,
                        format!("merge reducer requires an object, found {}", type_name(other)),
                    ))
                }
            };
            match write {
                Value::Object(incoming) => {
                    for (k, v) in incoming {
                        base.insert(k, v);
                    }
                }
                Value::Null => {}
                other => {
                    return Err(ReducerError::new(
                        channel,
                        format!("merge reducer requires an object, found {}", type_name(&other)),
                    ))
                }
            }
            Ok(Value::Object(base))
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn replace_is_idempotent() {
        let a = apply_reducer("x", Some(&json!(1)), json!(2), ReducerKind::Replace).unwrap();
        let b = apply_reducer("x", Some(&a), json!(2), ReducerKind::Replace).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, json!(2));
    }

    #[test]
    fn append_preserves_order() {
        let mut acc = None;
        let mut result = Value::Null;
        for item in [json!(1), json!(2), json!(3)] {
            result = apply_reducer("items", acc.as_ref(), item, ReducerKind::Append).unwrap();
            acc = Some(result.clone());
        }
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn append_concatenates_lists() {
        let result = apply_reducer(
            "items",
            Some(&json!([1, 2])),
            json!([3, 4]),
            ReducerKind::Append,
        )
        .unwrap();
        assert_eq!(result, json!([1, 2, 3, 4]));
    }

    #[test]
    fn append_rejects_non_list_base() {
        let err = apply_reducer("items", Some(&json!("oops")), json!(1), ReducerKind::Append);
        assert!(err.is_err());
    }

    #[test]
    fn merge_key_wise_union_last_writer_wins() {
        let base = json!({"a": 1, "b": 2});
        let result = apply_reducer(
            "state",
            Some(&base),
            json!({"b": 20, "c": 3}),
            ReducerKind::Merge,
        )
        .unwrap();
        assert_eq!(result, json!({"a": 1, "b": 20, "c": 3}));
    }

    #[test]
    fn merge_rejects_non_object_base() {
        let err = apply_reducer("state", Some(&json!([1])), json!({}), ReducerKind::Merge);
        assert!(err.is_err());
    }

    #[test]
    fn literal_conversion_covers_composite_shapes() {
        let lit = Literal::Map(BTreeMap::from([
            ("a".to_string(), Literal::Int(1)),
            ("b".to_string(), Literal::List(vec![Literal::Bool(true), Literal::Null])),
        ]));
        assert_eq!(literal_to_value(&lit), json!({"a": 1, "b": [true, null]}));
    }
}

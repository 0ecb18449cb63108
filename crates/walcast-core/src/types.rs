use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::ident::TableName;

/// A column value as rendered by wal2json, supporting common JSON types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(obj) => serde_json::Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Column name to value map: a raw row image before the table mapper runs.
pub type FieldMap = HashMap<String, Value>;

/// Metadata shared by every WAL event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaData {
    /// Commit timestamp reported by the server.
    pub timestamp: DateTime<FixedOffset>,
}

/// Row-level payload of a change event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangePayload<R> {
    Insert { new: R },
    Update { old: R, new: R },
    Delete { old: R },
    Truncate,
}

impl<R> ChangePayload<R> {
    /// Convert every row image with `f`, stopping at the first failure.
    pub fn try_map<T, E>(self, mut f: impl FnMut(R) -> Result<T, E>) -> Result<ChangePayload<T>, E> {
        Ok(match self {
            ChangePayload::Insert { new } => ChangePayload::Insert { new: f(new)? },
            ChangePayload::Update { old, new } => ChangePayload::Update {
                old: f(old)?,
                new: f(new)?,
            },
            ChangePayload::Delete { old } => ChangePayload::Delete { old: f(old)? },
            ChangePayload::Truncate => ChangePayload::Truncate,
        })
    }

    /// Short operation name, used in logs.
    pub fn op(&self) -> &'static str {
        match self {
            ChangePayload::Insert { .. } => "insert",
            ChangePayload::Update { .. } => "update",
            ChangePayload::Delete { .. } => "delete",
            ChangePayload::Truncate => "truncate",
        }
    }
}

/// An event published to listener subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WalEvent<R> {
    /// A logical decoding message emitted with `pg_logical_emit_message`.
    Message {
        meta_data: MetaData,
        transactional: bool,
        prefix: String,
        content: String,
    },
    /// A row change on a registered table.
    Change {
        table: TableName,
        meta_data: MetaData,
        payload: ChangePayload<R>,
    },
}

impl<R> WalEvent<R> {
    pub fn meta_data(&self) -> &MetaData {
        match self {
            WalEvent::Message { meta_data, .. } | WalEvent::Change { meta_data, .. } => meta_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_is_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Bool(true).is_null());
        assert!(!Value::Int(42).is_null());
        assert!(!Value::String("test".into()).is_null());
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(42).as_i64(), Some(42));
        assert_eq!(Value::Float(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::Int(42).as_f64(), Some(42.0));
        assert_eq!(Value::String("hello".into()).as_str(), Some("hello"));
    }

    #[test]
    fn test_value_from_json() {
        let json = serde_json::json!({"sku": "A-1", "qty": 3, "price": 9.5, "tags": ["x"]});
        let value = Value::from(json);

        let Value::Object(fields) = value else {
            panic!("expected object");
        };
        assert_eq!(fields.get("sku"), Some(&Value::String("A-1".into())));
        assert_eq!(fields.get("qty"), Some(&Value::Int(3)));
        assert_eq!(fields.get("price"), Some(&Value::Float(9.5)));
        assert_eq!(
            fields.get("tags"),
            Some(&Value::Array(vec![Value::String("x".into())]))
        );
    }

    #[test]
    fn test_payload_try_map() {
        let payload: ChangePayload<i64> = ChangePayload::Update { old: 1, new: 2 };
        let mapped: Result<ChangePayload<String>, ()> = payload.try_map(|v| Ok(v.to_string()));
        assert_eq!(
            mapped.unwrap(),
            ChangePayload::Update {
                old: "1".to_string(),
                new: "2".to_string()
            }
        );

        let failing: Result<ChangePayload<i64>, &str> =
            ChangePayload::Delete { old: 1 }.try_map(|_| Err("nope"));
        assert_eq!(failing, Err("nope"));

        let truncate: Result<ChangePayload<i64>, ()> =
            ChangePayload::<i64>::Truncate.try_map(|_| Err(()));
        assert_eq!(truncate, Ok(ChangePayload::Truncate));
    }

    #[test]
    fn test_event_serializes_with_tags() {
        let event: WalEvent<FieldMap> = WalEvent::Change {
            table: "public.orders".parse().unwrap(),
            meta_data: MetaData {
                timestamp: DateTime::parse_from_rfc3339("2024-01-15T10:30:00+00:00").unwrap(),
            },
            payload: ChangePayload::Insert {
                new: [("id".to_string(), Value::Int(1))].into_iter().collect(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "change");
        assert_eq!(json["table"], "public.orders");
        assert_eq!(json["payload"]["kind"], "insert");
        assert_eq!(json["payload"]["new"]["id"], 1);
    }
}

//! Decoder for wal2json format version 2.
//!
//! The listener starts the stream with `include-transaction=false`,
//! `include-timestamp=true` and `include-types=false`, so every buffer holds a single
//! JSON object describing one change or one logical message.

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::ident::TableName;
use crate::types::{ChangePayload, FieldMap, MetaData, Value, WalEvent};

/// Textual timestamp format produced by wal2json, e.g. `2024-01-15 10:30:00.123456+00`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// A decoded wal2json message, one variant per `action`.
#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    Message(LogicalMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Truncate(TruncateMessage),
}

/// `action = "M"`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LogicalMessage {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    pub transactional: bool,
    pub prefix: String,
    pub content: String,
}

/// `action = "I"`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InsertMessage {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    pub schema: String,
    pub table: String,
    #[serde(deserialize_with = "deserialize_fields")]
    pub columns: FieldMap,
}

/// `action = "U"`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateMessage {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    pub schema: String,
    pub table: String,
    #[serde(deserialize_with = "deserialize_fields")]
    pub columns: FieldMap,
    #[serde(default, deserialize_with = "deserialize_fields")]
    pub identity: FieldMap,
}

/// `action = "D"`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteMessage {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    pub schema: String,
    pub table: String,
    #[serde(default, deserialize_with = "deserialize_fields")]
    pub identity: FieldMap,
}

/// `action = "T"`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TruncateMessage {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<FixedOffset>,
    pub schema: String,
    pub table: String,
}

#[derive(Debug, Deserialize)]
struct Column {
    name: String,
    value: serde_json::Value,
}

impl WalMessage {
    /// Decode one replication buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let json: serde_json::Value = serde_json::from_slice(data)?;

        let action = match json.get("action") {
            Some(serde_json::Value::String(action)) => action.clone(),
            _ => return Err(Error::MissingAction),
        };

        match action.as_str() {
            "M" => decode_as(json).map(WalMessage::Message),
            "I" => decode_as(json).map(WalMessage::Insert),
            "U" => decode_as(json).map(WalMessage::Update),
            "D" => decode_as(json).map(WalMessage::Delete),
            "T" => decode_as(json).map(WalMessage::Truncate),
            _ => Err(Error::UnknownAction(action)),
        }
    }

    /// Convert into the public event shape with raw field maps.
    pub fn into_event(self) -> Result<WalEvent<FieldMap>> {
        let event = match self {
            WalMessage::Message(m) => WalEvent::Message {
                meta_data: MetaData {
                    timestamp: m.timestamp,
                },
                transactional: m.transactional,
                prefix: m.prefix,
                content: m.content,
            },
            WalMessage::Insert(m) => WalEvent::Change {
                table: TableName::new(&m.schema, &m.table)?,
                meta_data: MetaData {
                    timestamp: m.timestamp,
                },
                payload: ChangePayload::Insert { new: m.columns },
            },
            WalMessage::Update(m) => WalEvent::Change {
                table: TableName::new(&m.schema, &m.table)?,
                meta_data: MetaData {
                    timestamp: m.timestamp,
                },
                payload: ChangePayload::Update {
                    old: m.identity,
                    new: m.columns,
                },
            },
            WalMessage::Delete(m) => WalEvent::Change {
                table: TableName::new(&m.schema, &m.table)?,
                meta_data: MetaData {
                    timestamp: m.timestamp,
                },
                payload: ChangePayload::Delete { old: m.identity },
            },
            WalMessage::Truncate(m) => WalEvent::Change {
                table: TableName::new(&m.schema, &m.table)?,
                meta_data: MetaData {
                    timestamp: m.timestamp,
                },
                payload: ChangePayload::Truncate,
            },
        };

        Ok(event)
    }
}

/// Decode a buffer straight into an unmapped event.
pub fn decode_event(data: &[u8]) -> Result<WalEvent<FieldMap>> {
    WalMessage::decode(data)?.into_event()
}

fn decode_as<T: DeserializeOwned>(json: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(json)?)
}

/// Parse a wal2json timestamp with the exact server format.
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|source| Error::InvalidTimestamp {
        value: value.to_string(),
        source,
    })
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<FixedOffset>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// Fold the ordered `{name, value}` list into a map. Repeated names keep the last value.
fn deserialize_fields<'de, D>(deserializer: D) -> std::result::Result<FieldMap, D::Error>
where
    D: Deserializer<'de>,
{
    let columns = Vec::<Column>::deserialize(deserializer)?;
    Ok(columns
        .into_iter()
        .map(|col| (col.name, Value::from(col.value)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2024-01-15 10:30:00.123456+00";

    fn field_map(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp(TS).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-15T10:30:00.123456+00:00");

        let offset = parse_timestamp("2024-01-15 10:30:00+05:30").unwrap();
        assert_eq!(offset.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
    }

    #[test]
    fn test_parse_timestamp_rejects_other_formats() {
        assert!(parse_timestamp("2024-01-15T10:30:00Z").is_err());
        assert!(parse_timestamp("2024-01-15 10:30:00").is_err());
        assert!(parse_timestamp("1705314600").is_err());
    }

    #[test]
    fn test_decode_insert() {
        let data = format!(
            r#"{{"action":"I","timestamp":"{TS}","schema":"public","table":"orders","columns":[{{"name":"id","value":1}},{{"name":"sku","value":"A-1"}}]}}"#
        );

        let event = decode_event(data.as_bytes()).unwrap();
        let WalEvent::Change { table, payload, .. } = event else {
            panic!("expected change");
        };
        assert_eq!(table.to_string(), "public.orders");
        assert_eq!(
            payload,
            ChangePayload::Insert {
                new: field_map(&[("id", Value::Int(1)), ("sku", Value::String("A-1".into()))])
            }
        );
    }

    #[test]
    fn test_decode_update() {
        let data = format!(
            r#"{{"action":"U","timestamp":"{TS}","schema":"public","table":"orders","columns":[{{"name":"id","value":1}},{{"name":"qty","value":5}}],"identity":[{{"name":"id","value":1}},{{"name":"qty","value":4}}]}}"#
        );

        let event = decode_event(data.as_bytes()).unwrap();
        let WalEvent::Change { payload, .. } = event else {
            panic!("expected change");
        };
        assert_eq!(
            payload,
            ChangePayload::Update {
                old: field_map(&[("id", Value::Int(1)), ("qty", Value::Int(4))]),
                new: field_map(&[("id", Value::Int(1)), ("qty", Value::Int(5))]),
            }
        );
    }

    #[test]
    fn test_decode_update_without_identity() {
        let data = format!(
            r#"{{"action":"U","timestamp":"{TS}","schema":"public","table":"orders","columns":[{{"name":"id","value":1}}]}}"#
        );

        let WalMessage::Update(update) = WalMessage::decode(data.as_bytes()).unwrap() else {
            panic!("expected update");
        };
        assert!(update.identity.is_empty());
    }

    #[test]
    fn test_decode_delete() {
        let data = format!(
            r#"{{"action":"D","timestamp":"{TS}","schema":"public","table":"orders","identity":[{{"name":"id","value":7}}]}}"#
        );

        let event = decode_event(data.as_bytes()).unwrap();
        let WalEvent::Change { payload, .. } = event else {
            panic!("expected change");
        };
        assert_eq!(
            payload,
            ChangePayload::Delete {
                old: field_map(&[("id", Value::Int(7))])
            }
        );
    }

    #[test]
    fn test_decode_truncate() {
        let data = format!(
            r#"{{"action":"T","timestamp":"{TS}","schema":"public","table":"orders"}}"#
        );

        let event = decode_event(data.as_bytes()).unwrap();
        let WalEvent::Change { table, payload, .. } = event else {
            panic!("expected change");
        };
        assert_eq!(table.table(), "orders");
        assert_eq!(payload, ChangePayload::Truncate);
    }

    #[test]
    fn test_decode_message() {
        let data = format!(
            r#"{{"action":"M","timestamp":"{TS}","transactional":false,"prefix":"audit","content":"hello"}}"#
        );

        let event = decode_event(data.as_bytes()).unwrap();
        assert_eq!(
            event,
            WalEvent::Message {
                meta_data: MetaData {
                    timestamp: parse_timestamp(TS).unwrap()
                },
                transactional: false,
                prefix: "audit".into(),
                content: "hello".into(),
            }
        );
    }

    #[test]
    fn test_decode_ignores_column_types() {
        let data = format!(
            r#"{{"action":"I","timestamp":"{TS}","schema":"public","table":"orders","columns":[{{"name":"id","type":"integer","value":1}}]}}"#
        );

        assert!(WalMessage::decode(data.as_bytes()).is_ok());
    }

    #[test]
    fn test_duplicate_column_keeps_last() {
        let data = format!(
            r#"{{"action":"I","timestamp":"{TS}","schema":"public","table":"orders","columns":[{{"name":"id","value":1}},{{"name":"id","value":2}}]}}"#
        );

        let WalMessage::Insert(insert) = WalMessage::decode(data.as_bytes()).unwrap() else {
            panic!("expected insert");
        };
        assert_eq!(insert.columns.get("id"), Some(&Value::Int(2)));
        assert_eq!(insert.columns.len(), 1);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        for action in ["B", "C", "X"] {
            let data = format!(r#"{{"action":"{action}"}}"#);
            assert!(matches!(
                WalMessage::decode(data.as_bytes()),
                Err(Error::UnknownAction(a)) if a == action
            ));
        }
    }

    #[test]
    fn test_missing_action_is_rejected() {
        assert!(matches!(
            WalMessage::decode(br#"{"schema":"public"}"#),
            Err(Error::MissingAction)
        ));
        assert!(matches!(
            WalMessage::decode(br#"{"action":7}"#),
            Err(Error::MissingAction)
        ));
    }

    #[test]
    fn test_bad_timestamp_is_rejected() {
        let data = r#"{"action":"T","timestamp":"2024-01-15T10:30:00Z","schema":"public","table":"orders"}"#;
        assert!(matches!(
            WalMessage::decode(data.as_bytes()),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_corrupt_buffer_is_rejected() {
        assert!(matches!(
            WalMessage::decode(b"{\"action\":\"I\",\"sch"),
            Err(Error::Json(_))
        ));
        assert!(WalMessage::decode(&[0xff, 0xfe]).is_err());
    }
}

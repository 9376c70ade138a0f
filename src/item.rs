//! Item/Format encoding (C1).
//!
//! Grounded in `original_source/src/item.py`: an [`Item`] bundles an
//! optional id/prev-id/meta with an ordered list of [`Format`] values, no
//! two of which may share a name. `export` produces a transport-neutral
//! [`Value`] tree in one of two shapes (formats inlined at the top level, or
//! nested under a `formats` key) and in one of two string representations
//! (text, for the HTTP/JSON wire; binary, for the message-bus wire).

use crate::error::{EpcpError, Result};
use std::collections::HashSet;

/// A transport-neutral value tree. Concrete and recursive so that the
/// binary/text coercion pass in [`Item::export`] is exhaustive at compile
/// time rather than relying on a dynamically-typed JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    /// Insertion-ordered key/value pairs. Keys are always [`Value::Text`] or
    /// [`Value::Bytes`] (coerced along with every other string in the tree).
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn map() -> Value {
        Value::Map(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        match self {
            Value::Map(entries) => entries.push((Value::Text(key.into()), value)),
            _ => panic!("Value::insert called on a non-map value"),
        }
    }

    /// Recursively coerce every string in the tree: to raw bytes when
    /// `binary_mode`, to decoded text otherwise. Containers are preserved.
    fn coerce(self, binary_mode: bool) -> Value {
        match self {
            Value::Text(s) => {
                if binary_mode {
                    Value::Bytes(s.into_bytes())
                } else {
                    Value::Text(s)
                }
            }
            Value::Bytes(b) => {
                if binary_mode {
                    Value::Bytes(b)
                } else {
                    Value::Text(String::from_utf8_lossy(&b).into_owned())
                }
            }
            Value::Seq(items) => {
                Value::Seq(items.into_iter().map(|v| v.coerce(binary_mode)).collect())
            }
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.coerce(binary_mode), v.coerce(binary_mode)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Convert a text-mode value tree into JSON. Panics if a non-text key
    /// survives to this point; callers only reach this after `coerce(false)`.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(&b).into_owned()),
            Value::Seq(items) => {
                serde_json::Value::Array(items.into_iter().map(Value::into_json).collect())
            }
            Value::Map(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = match k {
                        Value::Text(s) => s,
                        Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
                        other => panic!("non-string map key in JSON export: {other:?}"),
                    };
                    map.insert(key, v.into_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// A named serializer producing a transport-neutral mapping. Variants are
/// user-supplied; the crate never interprets their content.
pub trait Format: Send + Sync {
    /// Must be unique within a single [`Item`]; see [`Item::export`].
    fn name(&self) -> String;
    fn export(&self) -> Value;
}

/// The unit of publication: zero or more [`Format`]s plus optional
/// id/prev-id/meta, published to exactly one channel at a time.
pub struct Item {
    pub id: Option<String>,
    pub prev_id: Option<String>,
    pub meta: Option<Value>,
    formats: Vec<Box<dyn Format>>,
}

impl Item {
    pub fn new(formats: Vec<Box<dyn Format>>) -> Self {
        Item {
            id: None,
            prev_id: None,
            meta: None,
            formats,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_prev_id(mut self, prev_id: impl Into<String>) -> Self {
        self.prev_id = Some(prev_id.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Serialize this item. `formats_field` nests formats under a `formats`
    /// key (message-bus wire) instead of inlining them (HTTP/JSON wire).
    /// `binary_mode` recursively coerces every string to raw bytes instead
    /// of decoded text.
    ///
    /// Fails with [`EpcpError::InvalidItem`] if two formats share a name.
    pub fn export(&self, formats_field: bool, binary_mode: bool) -> Result<Value> {
        let mut seen = HashSet::with_capacity(self.formats.len());
        for f in &self.formats {
            if !seen.insert(f.name()) {
                return Err(EpcpError::InvalidItem(format!(
                    "more than one format named '{}'",
                    f.name()
                )));
            }
        }

        let mut out = Value::map();
        if let Some(id) = &self.id {
            out.insert("id", Value::Text(id.clone()));
        }
        if let Some(prev_id) = &self.prev_id {
            out.insert("prev-id", Value::Text(prev_id.clone()));
        }
        if let Some(meta) = &self.meta {
            out.insert("meta", meta.clone());
        }

        if formats_field {
            let mut formats = Value::map();
            for f in &self.formats {
                formats.insert(f.name(), f.export());
            }
            out.insert("formats", formats);
        } else {
            for f in &self.formats {
                match &mut out {
                    Value::Map(entries) => entries.push((Value::Text(f.name()), f.export())),
                    _ => unreachable!(),
                }
            }
        }

        Ok(out.coerce(binary_mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BodyFormat(&'static str, &'static str);

    impl Format for BodyFormat {
        fn name(&self) -> String {
            self.0.to_owned()
        }
        fn export(&self) -> Value {
            let mut v = Value::map();
            v.insert("body", Value::Text(self.1.to_owned()));
            v
        }
    }

    #[test]
    fn duplicate_format_names_fail_with_invalid_item() {
        let item = Item::new(vec![Box::new(BodyFormat("json", "a")), Box::new(BodyFormat("json", "b"))]);
        let err = item.export(false, false).unwrap_err();
        assert!(matches!(err, EpcpError::InvalidItem(_)));
    }

    #[test]
    fn text_mode_inlines_formats_at_top_level() {
        let item = Item::new(vec![Box::new(BodyFormat("json", "v"))]);
        let exported = item.export(false, false).unwrap();
        let json = exported.into_json();
        assert_eq!(json["json"]["body"], "v");
    }

    #[test]
    fn formats_field_nests_under_formats_key() {
        let item = Item::new(vec![Box::new(BodyFormat("json", "v"))]);
        let exported = item.export(true, false).unwrap();
        let json = exported.into_json();
        assert_eq!(json["formats"]["json"]["body"], "v");
        assert!(json.get("json").is_none());
    }

    #[test]
    fn binary_mode_coerces_nested_strings_to_bytes() {
        let item = Item::new(vec![Box::new(BodyFormat("json", "v"))]).with_id("abc");
        let exported = item.export(true, true).unwrap();
        match exported {
            Value::Map(entries) => {
                let (_, id_val) = entries.iter().find(|(k, _)| matches!(k, Value::Bytes(b) if b == b"id")).expect("id key present as bytes");
                assert_eq!(id_val, &Value::Bytes(b"abc".to_vec()));
            }
            _ => panic!("expected map"),
        }
    }

    #[test]
    fn id_and_prev_id_are_omitted_when_unset() {
        let item = Item::new(vec![Box::new(BodyFormat("json", "v"))]);
        let exported = item.export(false, false).unwrap();
        let json = exported.into_json();
        assert!(json.get("id").is_none());
        assert!(json.get("prev-id").is_none());
    }
}

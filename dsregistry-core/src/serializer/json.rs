//! Lenient typed accessors over JSON objects.
//!
//! Configuration files are edited by hand; numbers written as strings and
//! booleans written as `"true"` are accepted.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::Result;
use crate::error::RegistryError;

pub(super) type Object = Map<String, Value>;

pub(super) fn string(map: &Object, key: &str) -> Option<String> {
    match map.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(super) fn non_empty_string(map: &Object, key: &str) -> Option<String> {
    string(map, key).filter(|s| !s.is_empty())
}

pub(super) fn boolean(map: &Object, key: &str) -> Option<bool> {
    match map.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
        Value::Number(n) => Some(n.as_i64().is_some_and(|v| v != 0)),
        _ => None,
    }
}

pub(super) fn flag(map: &Object, key: &str) -> bool {
    boolean(map, key).unwrap_or(false)
}

pub(super) fn integer(map: &Object, key: &str) -> Option<i64> {
    match map.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(super) fn unsigned<T: TryFrom<i64>>(map: &Object, key: &str) -> Option<T> {
    integer(map, key).and_then(|v| T::try_from(v).ok())
}

pub(super) fn object<'a>(map: &'a Object, key: &str) -> Option<&'a Object> {
    map.get(key).and_then(Value::as_object)
}

/// `(key, object)` pairs of a nested object; non-object members are skipped.
pub(super) fn nested_objects<'a>(map: &'a Object, key: &str) -> Vec<(&'a str, &'a Object)> {
    object(map, key)
        .map(|nested| {
            nested
                .iter()
                .filter_map(|(k, v)| v.as_object().map(|o| (k.as_str(), o)))
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn object_list<'a>(map: &'a Object, key: &str) -> Vec<&'a Object> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

pub(super) fn string_map(map: &Object, key: &str) -> BTreeMap<String, String> {
    object(map, key)
        .map(|nested| {
            nested
                .iter()
                .filter_map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        Value::Null => return None,
                        other => other.to_string(),
                    };
                    Some((k.clone(), value))
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(super) fn string_list(map: &Object, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Serializes an object with tab indentation, keeping key order.
///
/// # Errors
/// Returns error if serialization fails
pub(super) fn to_pretty_bytes(map: Object) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    Value::Object(map)
        .serialize(&mut serializer)
        .map_err(|e| RegistryError::serialization("Encoding configuration", e))?;
    Ok(out)
}

/// True when the first non-whitespace byte opens a JSON object.
pub(super) fn looks_like_json(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

/// Builder that skips absent and empty values.
#[derive(Default)]
pub(super) struct ObjectWriter {
    map: Object,
}

impl ObjectWriter {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn value(&mut self, key: &str, value: Value) -> &mut Self {
        self.map.insert(key.to_string(), value);
        self
    }

    pub(super) fn string(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.value(key, Value::String(value.into()))
    }

    /// Writes the value only when it is present and not empty.
    pub(super) fn string_ne(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            self.string(key, value);
        }
        self
    }

    pub(super) fn boolean(&mut self, key: &str, value: bool) -> &mut Self {
        self.value(key, Value::Bool(value))
    }

    /// Writes the flag only when it is set.
    pub(super) fn flag(&mut self, key: &str, value: bool) -> &mut Self {
        if value {
            self.boolean(key, true);
        }
        self
    }

    pub(super) fn number(&mut self, key: &str, value: impl Into<serde_json::Number>) -> &mut Self {
        self.value(key, Value::Number(value.into()))
    }

    pub(super) fn string_map(&mut self, key: &str, values: &BTreeMap<String, String>) -> &mut Self {
        if !values.is_empty() {
            let nested = values
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            self.value(key, Value::Object(nested));
        }
        self
    }

    pub(super) fn string_list(&mut self, key: &str, values: &[String]) -> &mut Self {
        if !values.is_empty() {
            let items = values.iter().cloned().map(Value::String).collect();
            self.value(key, Value::Array(items));
        }
        self
    }

    pub(super) fn object(&mut self, key: &str, nested: Object) -> &mut Self {
        self.value(key, Value::Object(nested))
    }

    pub(super) fn object_ne(&mut self, key: &str, nested: Object) -> &mut Self {
        if !nested.is_empty() {
            self.object(key, nested);
        }
        self
    }

    pub(super) fn build(&mut self) -> Object {
        std::mem::take(&mut self.map)
    }
}

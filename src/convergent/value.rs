//! Entity values
//!
//! A JSON-compatible value tree. Nested entities are not inlined: a parent
//! holds a reference map `{"@@type": "ref", "id": "<oid>"}` pointing at the
//! child's OID.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::oid::Oid;

const TYPE_KEY: &str = "@@type";
const REF_TYPE: &str = "ref";
const REF_ID_KEY: &str = "id";

/// A value that can be stored in an entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn bool(b: bool) -> Self {
        Value::Bool(b)
    }

    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn empty_list() -> Self {
        Value::List(Vec::new())
    }

    /// Build a map from `(key, value)` pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// A reference token pointing at a nested entity.
    pub fn object_ref(oid: impl Into<Oid>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(TYPE_KEY.to_string(), Value::string(REF_TYPE));
        map.insert(REF_ID_KEY.to_string(), Value::String(oid.into()));
        Value::Map(map)
    }

    /// The OID this value refers to, if it is a reference token.
    pub fn as_object_ref(&self) -> Option<&str> {
        let Value::Map(map) = self else {
            return None;
        };
        if map.len() != 2 || map.get(TYPE_KEY) != Some(&Value::string(REF_TYPE)) {
            return None;
        }
        match map.get(REF_ID_KEY) {
            Some(Value::String(oid)) => Some(oid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a map field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

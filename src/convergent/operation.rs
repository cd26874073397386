//! Operation variants and the timestamped operation envelope

use serde::{Deserialize, Serialize};

use super::value::Value;
use crate::clock::Timestamp;
use crate::oid::Oid;

/// Which occurrences a `list-remove` takes out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveOnly {
    First,
    Last,
    All,
}

/// The mutation carried by an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum OperationData {
    /// Set a map key (or list index) to a value (latest-wins)
    Set { name: String, value: Value },

    /// Remove a map key (or list index)
    Remove { name: String },

    /// Insert values at a position
    ListInsert { index: usize, values: Vec<Value> },

    /// Delete `count` items starting at a position
    ListDelete { index: usize, count: usize },

    /// Append a value
    ListPush { value: Value },

    /// Remove a value by identity rather than position
    ListRemove { value: Value, only: RemoveOnly },

    /// Append a value if it is not already present (set semantics)
    ListAdd { value: Value },

    /// Move the item at `from` to `to`
    ListMoveByIndex { from: usize, to: usize },

    /// Move the first occurrence of `value` to `index`
    ListMoveByRef { value: Value, index: usize },

    /// Replace the whole entity value
    Initialize { value: Value },

    /// Delete the entity
    Delete,

    /// No observable change; marks the entity as written
    Touch,
}

impl OperationData {
    pub fn set(name: impl Into<String>, value: Value) -> Self {
        OperationData::Set {
            name: name.into(),
            value,
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        OperationData::Remove { name: name.into() }
    }

    pub fn initialize(value: Value) -> Self {
        OperationData::Initialize { value }
    }

    pub fn list_push(value: Value) -> Self {
        OperationData::ListPush { value }
    }

    pub fn list_insert(index: usize, values: Vec<Value>) -> Self {
        OperationData::ListInsert { index, values }
    }

    pub fn list_delete(index: usize, count: usize) -> Self {
        OperationData::ListDelete { index, count }
    }

    pub fn list_remove(value: Value, only: RemoveOnly) -> Self {
        OperationData::ListRemove { value, only }
    }

    pub fn list_add(value: Value) -> Self {
        OperationData::ListAdd { value }
    }

    /// Wire name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            OperationData::Set { .. } => "set",
            OperationData::Remove { .. } => "remove",
            OperationData::ListInsert { .. } => "list-insert",
            OperationData::ListDelete { .. } => "list-delete",
            OperationData::ListPush { .. } => "list-push",
            OperationData::ListRemove { .. } => "list-remove",
            OperationData::ListAdd { .. } => "list-add",
            OperationData::ListMoveByIndex { .. } => "list-move-by-index",
            OperationData::ListMoveByRef { .. } => "list-move-by-ref",
            OperationData::Initialize { .. } => "initialize",
            OperationData::Delete => "delete",
            OperationData::Touch => "touch",
        }
    }

    /// Whether this is one of the `list-*` variants.
    pub fn is_list_op(&self) -> bool {
        self.kind().starts_with("list-")
    }

    /// The field a `set`/`remove` addresses.
    pub fn field_name(&self) -> Option<&str> {
        match self {
            OperationData::Set { name, .. } | OperationData::Remove { name } => Some(name),
            _ => None,
        }
    }
}

/// An operation addressed to an entity and stamped with a logical time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub oid: Oid,
    pub timestamp: Timestamp,
    pub data: OperationData,
    /// Opaque authorization predicate, carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz: Option<String>,
}

impl Operation {
    pub fn new(oid: impl Into<Oid>, timestamp: Timestamp, data: OperationData) -> Self {
        Self {
            oid: oid.into(),
            timestamp,
            data,
            authz: None,
        }
    }

    pub fn with_authz(mut self, authz: impl Into<String>) -> Self {
        self.authz = Some(authz.into());
        self
    }

    /// Identity used for idempotent storage.
    pub fn key(&self) -> (&str, &Timestamp) {
        (&self.oid, &self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;

    #[test]
    fn test_wire_shape_is_tagged() {
        let op = Operation::new(
            "items/a",
            TimeAuthority::zero(1),
            OperationData::list_remove(Value::int(2), RemoveOnly::Last),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["data"]["op"], "list-remove");
        assert_eq!(json["data"]["only"], "last");
        assert!(json.get("authz").is_none());
        assert_eq!(op.data.kind(), "list-remove");
    }

    #[test]
    fn test_unknown_kind_fails_to_decode() {
        let raw = serde_json::json!({
            "oid": "items/a",
            "timestamp": "0001:000000000000001:000000:a",
            "data": {"op": "list-explode"}
        });
        assert!(serde_json::from_value::<Operation>(raw).is_err());
    }

    #[test]
    fn test_field_name() {
        assert_eq!(OperationData::set("title", Value::Null).field_name(), Some("title"));
        assert_eq!(OperationData::remove("title").field_name(), Some("title"));
        assert_eq!(OperationData::Touch.field_name(), None);
    }
}

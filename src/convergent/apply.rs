//! Applying a single operation to an entity value
//!
//! `apply` is pure: it consumes the current value and returns the next one.
//! `None` stands for an entity that does not exist (never created, or
//! deleted). Only `initialize` brings an absent entity into existence.

use std::cmp::Ordering;

use super::operation::{Operation, OperationData, RemoveOnly};
use super::value::Value;
use super::ConvergentError;

/// Apply `op` to the entity's current value.
pub fn apply(current: Option<Value>, op: &Operation) -> Result<Option<Value>, ConvergentError> {
    let oid = op.oid.as_str();
    let value = match (&op.data, current) {
        (OperationData::Initialize { value }, _) => return Ok(Some(value.clone())),
        (OperationData::Delete, _) => return Ok(None),
        // writes to a deleted entity are dropped
        (_, None) => return Ok(None),
        (_, Some(value)) => value,
    };

    let next = match &op.data {
        OperationData::Initialize { .. } | OperationData::Delete | OperationData::Touch => value,

        OperationData::Set { name, value: new } => match value {
            Value::Map(mut map) => {
                map.insert(name.clone(), new.clone());
                Value::Map(map)
            }
            // overwrite in place or append at the end, never leave a gap
            Value::List(mut items) => {
                let index = parse_index(oid, name)?;
                match index.cmp(&items.len()) {
                    Ordering::Less => items[index] = new.clone(),
                    Ordering::Equal => items.push(new.clone()),
                    Ordering::Greater => {
                        return Err(ConvergentError::InvalidIndex {
                            oid: oid.to_string(),
                            name: name.clone(),
                        })
                    }
                }
                Value::List(items)
            }
            other => return Err(ConvergentError::shape(oid, "map or list", &other)),
        },

        OperationData::Remove { name } => match value {
            Value::Map(mut map) => {
                map.remove(name);
                Value::Map(map)
            }
            Value::List(mut items) => {
                let index = parse_index(oid, name)?;
                if index < items.len() {
                    items.remove(index);
                }
                Value::List(items)
            }
            other => return Err(ConvergentError::shape(oid, "map or list", &other)),
        },

        list_op => {
            let mut items = into_list(oid, value)?;
            apply_list(&mut items, list_op);
            Value::List(items)
        }
    };

    Ok(Some(next))
}

fn apply_list(items: &mut Vec<Value>, data: &OperationData) {
    match data {
        OperationData::ListInsert { index, values } => {
            let at = (*index).min(items.len());
            items.splice(at..at, values.iter().cloned());
        }
        OperationData::ListDelete { index, count } => {
            if *index < items.len() {
                let end = index.saturating_add(*count).min(items.len());
                items.drain(*index..end);
            }
        }
        OperationData::ListPush { value } => items.push(value.clone()),
        OperationData::ListRemove { value, only } => match only {
            RemoveOnly::First => {
                if let Some(pos) = items.iter().position(|v| v == value) {
                    items.remove(pos);
                }
            }
            RemoveOnly::Last => {
                if let Some(pos) = items.iter().rposition(|v| v == value) {
                    items.remove(pos);
                }
            }
            RemoveOnly::All => items.retain(|v| v != value),
        },
        OperationData::ListAdd { value } => {
            if !items.contains(value) {
                items.push(value.clone());
            }
        }
        OperationData::ListMoveByIndex { from, to } => {
            if *from < items.len() {
                let item = items.remove(*from);
                let to = (*to).min(items.len());
                items.insert(to, item);
            }
        }
        OperationData::ListMoveByRef { value, index } => {
            if let Some(from) = items.iter().position(|v| v == value) {
                let item = items.remove(from);
                let to = (*index).min(items.len());
                items.insert(to, item);
            }
        }
        OperationData::Set { .. }
        | OperationData::Remove { .. }
        | OperationData::Initialize { .. }
        | OperationData::Delete
        | OperationData::Touch => {}
    }
}

/// View an entity value as a list. An empty map is an entity whose shape is
/// not known yet and counts as an empty list.
pub(crate) fn list_view<'a>(oid: &str, value: &'a Value) -> Result<&'a [Value], ConvergentError> {
    match value {
        Value::List(items) => Ok(items),
        Value::Map(map) if map.is_empty() => Ok(&[]),
        other => Err(ConvergentError::shape(oid, "list", other)),
    }
}

fn into_list(oid: &str, value: Value) -> Result<Vec<Value>, ConvergentError> {
    match value {
        Value::List(items) => Ok(items),
        Value::Map(map) if map.is_empty() => Ok(Vec::new()),
        other => Err(ConvergentError::shape(oid, "list", &other)),
    }
}

pub(crate) fn parse_index(oid: &str, name: &str) -> Result<usize, ConvergentError> {
    name.parse().map_err(|_| ConvergentError::InvalidIndex {
        oid: oid.to_string(),
        name: name.to_string(),
    })
}

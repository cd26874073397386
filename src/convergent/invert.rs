//! Inverting operations for undo
//!
//! `invert` looks at the entity value as it was immediately *before* an
//! operation applied and returns the operations that take it back there.

use super::apply::{list_view, parse_index};
use super::operation::{Operation, OperationData, RemoveOnly};
use super::value::Value;
use super::ConvergentError;
use crate::clock::Timestamp;

/// Compute the operations that reverse `op`, given the value it was applied
/// to. `now` supplies a timestamp for each produced operation.
pub fn invert(
    before: Option<&Value>,
    op: &Operation,
    mut now: impl FnMut() -> Timestamp,
) -> Result<Vec<Operation>, ConvergentError> {
    let data = invert_data(before, op)?;
    Ok(data
        .into_iter()
        .map(|data| Operation {
            oid: op.oid.clone(),
            timestamp: now(),
            data,
            authz: op.authz.clone(),
        })
        .collect())
}

fn invert_data(before: Option<&Value>, op: &Operation) -> Result<Vec<OperationData>, ConvergentError> {
    let oid = op.oid.as_str();
    let before = match (&op.data, before) {
        (OperationData::Initialize { .. }, None) => return Ok(vec![OperationData::Delete]),
        (OperationData::Initialize { .. }, Some(previous)) => {
            return Ok(vec![OperationData::initialize(previous.clone())])
        }
        (OperationData::Delete, Some(previous)) => {
            return Ok(vec![OperationData::initialize(previous.clone())])
        }
        // nothing changed, nothing to reverse
        (OperationData::Touch, _) | (_, None) => return Ok(Vec::new()),
        (_, Some(value)) => value,
    };

    // a list op turns a shapeless `{}` into a list, only re-initializing
    // brings the map back
    if op.data.is_list_op() && matches!(before, Value::Map(map) if map.is_empty()) {
        return Ok(vec![OperationData::initialize(before.clone())]);
    }

    let inverse = match &op.data {
        OperationData::Initialize { .. } | OperationData::Delete | OperationData::Touch => Vec::new(),

        OperationData::Set { name, .. } => match before {
            Value::Map(map) => match map.get(name) {
                Some(previous) => vec![OperationData::set(name.clone(), previous.clone())],
                None => vec![OperationData::remove(name.clone())],
            },
            Value::List(items) => {
                let index = parse_index(oid, name)?;
                match items.get(index) {
                    Some(previous) => vec![OperationData::set(name.clone(), previous.clone())],
                    // set at the end appends one item
                    None if index == items.len() => vec![OperationData::list_delete(index, 1)],
                    None => {
                        return Err(ConvergentError::InvalidIndex {
                            oid: oid.to_string(),
                            name: name.clone(),
                        })
                    }
                }
            }
            other => return Err(ConvergentError::shape(oid, "map or list", other)),
        },

        OperationData::Remove { name } => match before {
            Value::Map(map) => match map.get(name) {
                Some(previous) => vec![OperationData::set(name.clone(), previous.clone())],
                None => Vec::new(),
            },
            Value::List(items) => {
                let index = parse_index(oid, name)?;
                match items.get(index) {
                    Some(previous) => vec![OperationData::list_insert(index, vec![previous.clone()])],
                    None => Vec::new(),
                }
            }
            other => return Err(ConvergentError::shape(oid, "map or list", other)),
        },

        OperationData::ListInsert { index, values } => {
            let items = list_view(oid, before)?;
            if values.is_empty() {
                Vec::new()
            } else {
                vec![OperationData::list_delete((*index).min(items.len()), values.len())]
            }
        }

        OperationData::ListDelete { index, count } => {
            let items = list_view(oid, before)?;
            if *index >= items.len() || *count == 0 {
                Vec::new()
            } else {
                let end = index.saturating_add(*count).min(items.len());
                vec![OperationData::list_insert(*index, items[*index..end].to_vec())]
            }
        }

        // Known approximation: with duplicate values this removes the last
        // occurrence, which may not be the one the push appended once other
        // replicas' edits interleave.
        OperationData::ListPush { value } => {
            list_view(oid, before)?;
            vec![OperationData::list_remove(value.clone(), RemoveOnly::Last)]
        }

        OperationData::ListRemove { value, only } => {
            let items = list_view(oid, before)?;
            let positions: Vec<usize> = items
                .iter()
                .enumerate()
                .filter(|(_, v)| *v == value)
                .map(|(i, _)| i)
                .collect();
            let restored: Vec<usize> = match only {
                RemoveOnly::First => positions.first().copied().into_iter().collect(),
                RemoveOnly::Last => positions.last().copied().into_iter().collect(),
                // ascending, so each insert lands at its original index
                RemoveOnly::All => positions,
            };
            restored
                .into_iter()
                .map(|i| OperationData::list_insert(i, vec![value.clone()]))
                .collect()
        }

        OperationData::ListAdd { value } => {
            let items = list_view(oid, before)?;
            if items.contains(value) {
                Vec::new()
            } else {
                vec![OperationData::list_remove(value.clone(), RemoveOnly::Last)]
            }
        }

        OperationData::ListMoveByIndex { from, to } => {
            let items = list_view(oid, before)?;
            if *from >= items.len() {
                Vec::new()
            } else {
                let landed = (*to).min(items.len() - 1);
                vec![OperationData::ListMoveByIndex {
                    from: landed,
                    to: *from,
                }]
            }
        }

        OperationData::ListMoveByRef { value, index } => {
            let items = list_view(oid, before)?;
            match items.iter().position(|v| v == value) {
                Some(from) => {
                    let landed = (*index).min(items.len() - 1);
                    vec![OperationData::ListMoveByIndex { from: landed, to: from }]
                }
                None => Vec::new(),
            }
        }
    };

    Ok(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;
    use crate::convergent::apply::apply;
    use std::sync::Arc;

    fn list(values: &[i64]) -> Value {
        Value::List(values.iter().map(|n| Value::int(*n)).collect())
    }

    /// apply(apply(v, op), invert(v, op)) == v
    fn assert_round_trip(before: Option<Value>, data: OperationData) {
        let clock = TimeAuthority::with_wall_clock("t", Arc::new(|| 10));
        let op = Operation::new("items/a", clock.now(1), data.clone());

        let inverse = invert(before.as_ref(), &op, || clock.now(1)).unwrap();
        let mut value = apply(before.clone(), &op).unwrap();
        for undo in &inverse {
            value = apply(value, undo).unwrap();
        }
        assert_eq!(value, before, "round trip failed for {:?}", data);
    }

    #[test]
    fn test_round_trip_map_ops() {
        let v = Value::map([("title", Value::string("a")), ("n", Value::int(1))]);
        assert_round_trip(Some(v.clone()), OperationData::set("title", Value::string("b")));
        assert_round_trip(Some(v.clone()), OperationData::set("fresh", Value::Null));
        assert_round_trip(Some(v.clone()), OperationData::remove("n"));
        assert_round_trip(Some(v.clone()), OperationData::remove("missing"));
        assert_round_trip(Some(v), OperationData::Touch);
    }

    #[test]
    fn test_round_trip_list_ops() {
        let v = list(&[1, 2, 1, 3]);
        assert_round_trip(Some(v.clone()), OperationData::set("1", Value::int(7)));
        assert_round_trip(Some(v.clone()), OperationData::set("4", Value::int(7)));
        assert_round_trip(Some(v.clone()), OperationData::remove("2"));
        assert_round_trip(Some(v.clone()), OperationData::list_insert(2, vec![Value::int(8), Value::int(9)]));
        assert_round_trip(Some(v.clone()), OperationData::list_insert(40, vec![Value::int(8)]));
        assert_round_trip(Some(v.clone()), OperationData::list_delete(1, 2));
        assert_round_trip(Some(v.clone()), OperationData::list_delete(3, 9));
        assert_round_trip(Some(v.clone()), OperationData::list_push(Value::int(4)));
        assert_round_trip(Some(v.clone()), OperationData::list_remove(Value::int(1), RemoveOnly::First));
        assert_round_trip(Some(v.clone()), OperationData::list_remove(Value::int(1), RemoveOnly::Last));
        assert_round_trip(Some(v.clone()), OperationData::list_remove(Value::int(1), RemoveOnly::All));
        assert_round_trip(Some(v.clone()), OperationData::list_add(Value::int(2)));
        assert_round_trip(Some(v.clone()), OperationData::list_add(Value::int(5)));
        assert_round_trip(Some(v.clone()), OperationData::ListMoveByIndex { from: 0, to: 3 });
        assert_round_trip(Some(v.clone()), OperationData::ListMoveByIndex { from: 3, to: 10 });
        assert_round_trip(Some(v.clone()), OperationData::ListMoveByRef { value: Value::int(3), index: 0 });
        assert_round_trip(Some(v), OperationData::ListMoveByRef { value: Value::int(9), index: 0 });
    }

    #[test]
    fn test_round_trip_lifecycle_ops() {
        assert_round_trip(None, OperationData::initialize(list(&[1])));
        assert_round_trip(Some(list(&[2])), OperationData::initialize(list(&[1])));
        assert_round_trip(Some(list(&[2])), OperationData::Delete);
        assert_round_trip(None, OperationData::Delete);
        assert_round_trip(None, OperationData::set("a", Value::Null));
    }

    #[test]
    fn test_special_inverses() {
        let clock = TimeAuthority::with_wall_clock("t", Arc::new(|| 10));
        let ts = || TimeAuthority::zero(1);

        let create = Operation::new("items/a", clock.now(1), OperationData::initialize(Value::empty_map()));
        let inverse = invert(None, &create, ts).unwrap();
        assert_eq!(inverse[0].data, OperationData::Delete);

        let touch = Operation::new("items/a", clock.now(1), OperationData::Touch);
        assert!(invert(Some(&Value::empty_map()), &touch, ts).unwrap().is_empty());

        let push = Operation::new("items/a", clock.now(1), OperationData::list_push(Value::int(1)));
        let inverse = invert(Some(&list(&[1])), &push, ts).unwrap();
        assert_eq!(inverse[0].data, OperationData::list_remove(Value::int(1), RemoveOnly::Last));

        let remove_all = Operation::new(
            "items/a",
            clock.now(1),
            OperationData::list_remove(Value::int(1), RemoveOnly::All),
        );
        let inverse = invert(Some(&list(&[1, 2, 1])), &remove_all, ts).unwrap();
        assert_eq!(
            inverse.iter().map(|o| o.data.clone()).collect::<Vec<_>>(),
            vec![
                OperationData::list_insert(0, vec![Value::int(1)]),
                OperationData::list_insert(2, vec![Value::int(1)]),
            ]
        );
    }

    #[test]
    fn test_set_far_past_the_end_cannot_be_inverted() {
        let op = Operation::new(
            "items/a",
            TimeAuthority::zero(1),
            OperationData::set(usize::MAX.to_string(), Value::int(7)),
        );
        let err = invert(Some(&list(&[1])), &op, || TimeAuthority::zero(1)).unwrap_err();
        assert!(matches!(err, ConvergentError::InvalidIndex { .. }));
    }

    #[test]
    fn test_list_op_on_empty_map_restores_the_map() {
        let clock = TimeAuthority::with_wall_clock("t", Arc::new(|| 10));
        let insert = Operation::new(
            "items/a",
            clock.now(1),
            OperationData::list_insert(0, vec![Value::int(1)]),
        );
        let inverse = invert(Some(&Value::empty_map()), &insert, || clock.now(1)).unwrap();
        assert_eq!(inverse.len(), 1);
        assert_eq!(inverse[0].data, OperationData::initialize(Value::empty_map()));

        assert_round_trip(Some(Value::empty_map()), OperationData::list_insert(0, vec![Value::int(1)]));
        assert_round_trip(Some(Value::empty_map()), OperationData::list_push(Value::int(1)));
        assert_round_trip(Some(Value::empty_map()), OperationData::list_delete(0, 1));
    }

    #[test]
    fn test_inverse_keeps_authz() {
        let op = Operation::new("items/a", TimeAuthority::zero(1), OperationData::remove("x"))
            .with_authz("owner:alice");
        let inverse = invert(
            Some(&Value::map([("x", Value::int(1))])),
            &op,
            || TimeAuthority::zero(1),
        )
        .unwrap();
        assert_eq!(inverse[0].authz.as_deref(), Some("owner:alice"));
    }
}

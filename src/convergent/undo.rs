//! Undo/redo stacks
//!
//! Undo is a forward operation: undoing a batch issues its inverse as a new
//! batch with fresh timestamps. The log stays append-only and the undo itself
//! syncs (and can be undone) like any other edit.

use std::collections::HashMap;

use super::apply::apply;
use super::invert::invert;
use super::operation::Operation;
use super::value::Value;
use super::ConvergentError;
use crate::clock::Timestamp;
use crate::oid::Oid;

/// The operations that reverse one recorded batch, in the order they must be
/// applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UndoEntry {
    pub operations: Vec<Operation>,
}

impl UndoEntry {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Copy of the operations with fresh timestamps.
    pub fn restamp(&self, mut now: impl FnMut() -> Timestamp) -> Vec<Operation> {
        self.operations
            .iter()
            .map(|op| Operation {
                timestamp: now(),
                ..op.clone()
            })
            .collect()
    }
}

/// Compute the undo entry for a batch about to be applied.
///
/// `current` returns each entity's value before the batch. The batch is
/// replayed forward so every operation is inverted against the value
/// immediately before it, then the inverses are stacked in reverse.
pub fn compute_undo_entry(
    current: impl Fn(&str) -> Option<Value>,
    ops: &[Operation],
    mut now: impl FnMut() -> Timestamp,
) -> Result<UndoEntry, ConvergentError> {
    let mut scratch: HashMap<Oid, Option<Value>> = HashMap::new();
    let mut groups = Vec::with_capacity(ops.len());

    for op in ops {
        let before = match scratch.remove(&op.oid) {
            Some(value) => value,
            None => current(&op.oid),
        };
        groups.push(invert(before.as_ref(), op, &mut now)?);
        let after = apply(before, op)?;
        scratch.insert(op.oid.clone(), after);
    }

    Ok(UndoEntry {
        operations: groups.into_iter().rev().flatten().collect(),
    })
}

/// Bounded undo and redo stacks.
#[derive(Debug)]
pub struct UndoHistory {
    undo: Vec<UndoEntry>,
    redo: Vec<UndoEntry>,
    limit: usize,
}

impl UndoHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Record a fresh local batch. Clears the redo stack.
    pub fn record(&mut self, entry: UndoEntry) {
        if entry.is_empty() {
            return;
        }
        self.redo.clear();
        self.push_undo(entry);
    }

    fn push_undo(&mut self, entry: UndoEntry) {
        self.undo.push(entry);
        if self.undo.len() > self.limit {
            self.undo.remove(0);
        }
    }

    pub fn take_undo(&mut self) -> Option<UndoEntry> {
        self.undo.pop()
    }

    pub fn take_redo(&mut self) -> Option<UndoEntry> {
        self.redo.pop()
    }

    /// Store the inverse of an applied undo so it can be redone.
    pub fn push_redo(&mut self, entry: UndoEntry) {
        if !entry.is_empty() {
            self.redo.push(entry);
        }
    }

    /// Store the inverse of an applied redo without touching the redo stack.
    pub fn push_undo_from_redo(&mut self, entry: UndoEntry) {
        if !entry.is_empty() {
            self.push_undo(entry);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;
    use crate::convergent::{OperationData, RemoveOnly};
    use std::sync::Arc;

    #[test]
    fn test_batch_inverse_uses_intermediate_values() {
        let clock = TimeAuthority::with_wall_clock("a", Arc::new(|| 3));
        let start = Value::map([("n", Value::int(0))]);
        let batch = vec![
            Operation::new("items/a", clock.now(1), OperationData::set("n", Value::int(1))),
            Operation::new("items/a", clock.now(1), OperationData::set("n", Value::int(2))),
        ];

        let seed = start.clone();
        let entry = compute_undo_entry(move |_| Some(seed.clone()), &batch, || clock.now(1)).unwrap();

        // reverse order: undo the second set (back to 1) then the first (back to 0)
        assert_eq!(entry.operations[0].data, OperationData::set("n", Value::int(1)));
        assert_eq!(entry.operations[1].data, OperationData::set("n", Value::int(0)));

        let mut value = Some(start.clone());
        for op in batch.iter().chain(entry.operations.iter()) {
            value = apply(value, op).unwrap();
        }
        assert_eq!(value, Some(start));
    }

    #[test]
    fn test_undo_of_creation_deletes() {
        let clock = TimeAuthority::with_wall_clock("a", Arc::new(|| 3));
        let batch = vec![
            Operation::new("items/a", clock.now(1), OperationData::initialize(Value::empty_list())),
            Operation::new("items/a", clock.now(1), OperationData::list_push(Value::int(5))),
        ];
        let entry = compute_undo_entry(|_| None, &batch, || clock.now(1)).unwrap();
        assert_eq!(
            entry.operations.iter().map(|op| op.data.clone()).collect::<Vec<_>>(),
            vec![
                OperationData::list_remove(Value::int(5), RemoveOnly::Last),
                OperationData::Delete,
            ]
        );
    }

    #[test]
    fn test_restamp_issues_fresh_timestamps() {
        let clock = TimeAuthority::with_wall_clock("a", Arc::new(|| 3));
        let entry = UndoEntry {
            operations: vec![Operation::new("items/a", TimeAuthority::zero(1), OperationData::Delete)],
        };
        let restamped = entry.restamp(|| clock.now(1));
        assert!(restamped[0].timestamp > TimeAuthority::zero(1));
        assert_eq!(restamped[0].data, OperationData::Delete);
    }

    #[test]
    fn test_history_stacks() {
        let mut history = UndoHistory::new(2);
        assert!(!history.can_undo());

        let entry = |n: i64| UndoEntry {
            operations: vec![Operation::new(
                "items/a",
                TimeAuthority::zero(1),
                OperationData::set("n", Value::int(n)),
            )],
        };
        history.record(entry(1));
        history.record(entry(2));
        history.record(entry(3));
        history.record(UndoEntry::default());

        assert_eq!(history.take_undo(), Some(entry(3)));
        history.push_redo(entry(30));
        assert!(history.can_redo());
        assert_eq!(history.take_undo(), Some(entry(2)));
        // oldest entry fell off the bounded stack
        assert_eq!(history.take_undo(), None);

        history.record(entry(4));
        assert!(!history.can_redo());
    }
}

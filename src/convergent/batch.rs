//! Coalescing of rapid local writes
//!
//! Ten `set`s on one field in quick succession only need the last one to be
//! stored or sent. The batcher holds local operations for a short window and
//! hands them out with superseded writes removed.

use tokio::time::{Duration, Instant};

use super::operation::{Operation, OperationData};

/// Drop every `set`/`remove` that a later `set`/`remove` of the same field
/// overrides, as long as no other operation on that entity sits between
/// them. Input order is preserved otherwise.
///
/// Numeric names may address list positions, where two removes of `"0"`
/// take out two different items, so those are never dropped.
pub fn compress_operations(ops: Vec<Operation>) -> Vec<Operation> {
    let mut kept: Vec<Option<Operation>> = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(name) = op.data.field_name().filter(|name| !is_position(name)) {
            supersede(&mut kept, &op.oid, name);
        }
        kept.push(Some(op));
    }
    kept.into_iter().flatten().collect()
}

fn supersede(kept: &mut [Option<Operation>], oid: &str, name: &str) {
    for slot in kept.iter_mut().rev() {
        // Some(true): same field, drop it; Some(false): unrelated, keep looking;
        // None: structural change to the entity, stop
        let same_field = match slot.as_ref() {
            Some(earlier) if earlier.oid == oid => match &earlier.data {
                OperationData::Set { name: n, .. } | OperationData::Remove { name: n } if is_position(n) => None,
                OperationData::Set { name: n, .. } | OperationData::Remove { name: n } => Some(n == name),
                OperationData::Touch => Some(false),
                _ => None,
            },
            _ => Some(false),
        };
        match same_field {
            Some(true) => {
                *slot = None;
                return;
            }
            Some(false) => continue,
            None => return,
        }
    }
}

fn is_position(name: &str) -> bool {
    name.parse::<usize>().is_ok()
}

/// Buffers local operations for a batching window.
#[derive(Debug)]
pub struct OperationBatcher {
    window: Duration,
    max_size: usize,
    pending: Vec<Operation>,
    opened_at: Option<Instant>,
}

impl OperationBatcher {
    pub fn new(window: Duration, max_size: usize) -> Self {
        Self {
            window,
            max_size: max_size.max(1),
            pending: Vec::new(),
            opened_at: None,
        }
    }

    /// Queue operations. Returns true if the batch is now full and should be
    /// flushed immediately.
    pub fn push(&mut self, ops: impl IntoIterator<Item = Operation>) -> bool {
        let before = self.pending.len();
        self.pending.extend(ops);
        if self.pending.len() > before && self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.pending.len() >= self.max_size
    }

    /// Whether the window has elapsed (or the batch is full) at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.opened_at {
            Some(opened) => {
                self.pending.len() >= self.max_size || now.duration_since(opened) >= self.window
            }
            None => false,
        }
    }

    /// Take the pending operations, compressed.
    pub fn flush(&mut self) -> Vec<Operation> {
        self.opened_at = None;
        compress_operations(std::mem::take(&mut self.pending))
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drop everything queued (used when local state is discarded).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.opened_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;
    use crate::convergent::{reconstruct, Value};
    use std::sync::Arc;

    fn clock() -> TimeAuthority {
        TimeAuthority::with_wall_clock("a", Arc::new(|| 7))
    }

    #[test]
    fn test_repeated_sets_collapse_to_last() {
        let clock = clock();
        let mut ops = vec![Operation::new(
            "items/a",
            clock.now(1),
            OperationData::initialize(Value::map([("content", Value::string("Apples"))])),
        )];
        for n in 0..9 {
            ops.push(Operation::new(
                "items/a",
                clock.now(1),
                OperationData::set("content", Value::string(format!("edit {}", n))),
            ));
        }
        let last = ops.last().cloned().unwrap();

        let compressed = compress_operations(ops);
        assert_eq!(compressed.len(), 2);
        assert_eq!(compressed[0].data.kind(), "initialize");
        assert_eq!(compressed[1], last);
    }

    #[test]
    fn test_other_fields_and_entities_are_kept() {
        let clock = clock();
        let ops = vec![
            Operation::new("items/a", clock.now(1), OperationData::set("x", Value::int(1))),
            Operation::new("items/a", clock.now(1), OperationData::set("y", Value::int(1))),
            Operation::new("items/b", clock.now(1), OperationData::set("x", Value::int(1))),
            Operation::new("items/a", clock.now(1), OperationData::remove("x")),
        ];
        let compressed = compress_operations(ops.clone());
        assert_eq!(compressed, ops[1..].to_vec());
    }

    #[test]
    fn test_structural_ops_block_superseding() {
        let clock = clock();
        let ops = vec![
            Operation::new("items/a", clock.now(1), OperationData::set("x", Value::int(1))),
            Operation::new("items/a", clock.now(1), OperationData::Delete),
            Operation::new("items/a", clock.now(1), OperationData::set("x", Value::int(2))),
        ];
        assert_eq!(compress_operations(ops.clone()), ops);
    }

    #[test]
    fn test_list_positions_are_never_collapsed() {
        let clock = clock();
        let ops = vec![
            Operation::new(
                "lists/l:x",
                clock.now(1),
                OperationData::initialize(Value::List(vec![Value::int(1), Value::int(2), Value::int(3)])),
            ),
            Operation::new("lists/l:x", clock.now(1), OperationData::remove("0")),
            Operation::new("lists/l:x", clock.now(1), OperationData::remove("0")),
            Operation::new("lists/l:x", clock.now(1), OperationData::set("0", Value::int(9))),
            Operation::new("lists/l:x", clock.now(1), OperationData::set("0", Value::int(8))),
        ];

        let compressed = compress_operations(ops.clone());
        assert_eq!(compressed, ops);
        assert_eq!(
            reconstruct("lists/l:x", None, &compressed),
            Some(Value::List(vec![Value::int(8)]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_window_and_size() {
        let clock = clock();
        let mut batcher = OperationBatcher::new(Duration::from_millis(200), 3);
        assert!(!batcher.is_due(Instant::now()));

        let full = batcher.push([
            Operation::new("items/a", clock.now(1), OperationData::set("x", Value::int(1))),
            Operation::new("items/a", clock.now(1), OperationData::set("x", Value::int(2))),
        ]);
        assert!(!full);
        assert!(!batcher.is_due(Instant::now()));
        assert!(batcher.is_due(Instant::now() + Duration::from_millis(250)));

        let flushed = batcher.flush();
        assert_eq!(flushed.len(), 1);
        assert!(batcher.is_empty());

        let full = batcher.push((0..3).map(|n| {
            Operation::new("items/a", clock.now(1), OperationData::set(format!("f{}", n), Value::Null))
        }));
        assert!(full);
        assert!(batcher.is_due(Instant::now()));
    }
}

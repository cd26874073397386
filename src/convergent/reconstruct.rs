//! Rebuilding entity views from a baseline plus an operation log
//!
//! Operations are always folded in timestamp order, never arrival order.
//! Anything at or before the baseline's timestamp is already part of the
//! snapshot and is skipped, which keeps reconstruction idempotent across
//! rebases.
//!
//! Concurrent edits can leave an operation that no longer fits the entity
//! (a field set on something another replica re-created as a list). Replay
//! logs and skips it, so the result depends only on the set of operations
//! and every replica arrives at the same value.

use serde::{Deserialize, Serialize};

use super::apply::apply;
use super::operation::Operation;
use super::value::Value;
use crate::clock::Timestamp;
use crate::oid::Oid;

/// A materialized entity value as of `timestamp`.
///
/// `snapshot` is `None` when the entity had been deleted at that point; the
/// tombstone keeps later writes from resurrecting it after compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBaseline {
    pub oid: Oid,
    #[serde(default)]
    pub snapshot: Option<Value>,
    pub timestamp: Timestamp,
}

impl DocumentBaseline {
    pub fn new(oid: impl Into<Oid>, snapshot: Option<Value>, timestamp: Timestamp) -> Self {
        Self {
            oid: oid.into(),
            snapshot,
            timestamp,
        }
    }
}

/// Sort operations by `(timestamp, oid)` and drop exact repeats.
pub fn sort_operations(ops: &mut Vec<Operation>) {
    ops.sort_by(|a, b| (&a.timestamp, &a.oid).cmp(&(&b.timestamp, &b.oid)));
    ops.dedup_by(|a, b| a.timestamp == b.timestamp && a.oid == b.oid);
}

/// The operations for `oid` that come after `baseline`, in timestamp order.
fn pending_for<'a>(
    oid: &str,
    baseline: Option<&DocumentBaseline>,
    ops: &'a [Operation],
) -> Vec<&'a Operation> {
    let floor = baseline.map(|b| &b.timestamp);
    let mut pending: Vec<&Operation> = ops
        .iter()
        .filter(|op| op.oid == oid)
        .filter(|op| floor.map_or(true, |f| op.timestamp > *f))
        .collect();
    pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    pending.dedup_by(|a, b| a.timestamp == b.timestamp);
    pending
}

/// Reconstruct the current value of `oid`.
///
/// Without a baseline the entity starts as an empty map (it was created
/// somewhere we have not heard about yet). Returns `None` if the entity is
/// unknown or deleted.
pub fn reconstruct(oid: &str, baseline: Option<&DocumentBaseline>, ops: &[Operation]) -> Option<Value> {
    let pending = pending_for(oid, baseline, ops);
    let mut value = match baseline {
        Some(b) => b.snapshot.clone(),
        None if pending.is_empty() => return None,
        None => Some(Value::empty_map()),
    };
    for op in pending {
        match apply(value.clone(), op) {
            Ok(next) => value = next,
            Err(e) => log::warn!("Skipping {} at {}: {}", op.data.kind(), op.timestamp, e),
        }
    }
    value
}

/// Fold every operation of `oid` at or before `up_to` into a new baseline.
///
/// Returns the existing baseline unchanged when nothing qualifies.
pub fn fold_baseline(
    oid: &str,
    baseline: Option<&DocumentBaseline>,
    ops: &[Operation],
    up_to: &Timestamp,
) -> Option<DocumentBaseline> {
    let folded: Vec<Operation> = pending_for(oid, baseline, ops)
        .into_iter()
        .take_while(|op| op.timestamp <= *up_to)
        .cloned()
        .collect();

    let Some(last) = folded.last() else {
        return baseline.cloned();
    };
    let timestamp = last.timestamp.clone();
    let snapshot = reconstruct(oid, baseline, &folded);
    Some(DocumentBaseline::new(oid, snapshot, timestamp))
}

//! The entity arena
//!
//! A flat map from OID to that entity's baseline and pending operations.
//! Nested entities live alongside their roots rather than inside them, so any
//! of them can be fetched, rebased or dropped by address.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use super::operation::Operation;
use super::reconstruct::{fold_baseline, reconstruct, DocumentBaseline};
use super::value::Value;
use super::ConvergentError;
use crate::clock::Timestamp;
use crate::oid::{get_oid_root, get_oid_sub_id_range, is_root_oid, matches_root, Oid};

/// Called with the changed OID and its new view (`None` once deleted).
pub type ChangeCallback = Box<dyn Fn(&str, Option<&Value>) + Send + Sync>;

#[derive(Clone, Debug, Default)]
struct EntityLog {
    baseline: Option<DocumentBaseline>,
    /// Sorted by timestamp, unique per timestamp
    operations: Vec<Operation>,
}

impl EntityLog {
    /// Insert keeping timestamp order. Returns false for duplicates and for
    /// operations the baseline already covers.
    fn insert(&mut self, op: Operation) -> bool {
        if let Some(baseline) = &self.baseline {
            if op.timestamp <= baseline.timestamp {
                return false;
            }
        }
        match self
            .operations
            .binary_search_by(|existing| existing.timestamp.cmp(&op.timestamp))
        {
            Ok(_) => false,
            Err(pos) => {
                self.operations.insert(pos, op);
                true
            }
        }
    }

    fn view(&self, oid: &str) -> Option<Value> {
        reconstruct(oid, self.baseline.as_ref(), &self.operations)
    }
}

/// In-memory store of entity logs with cached views and change callbacks.
#[derive(Default)]
pub struct DocumentArena {
    entities: BTreeMap<Oid, EntityLog>,
    views: HashMap<Oid, Value>,
    subscribers: HashMap<Uuid, (Oid, ChangeCallback)>,
}

impl DocumentArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert operations, idempotently on `(oid, timestamp)`.
    ///
    /// Every operation is kept. One that no longer fits its entity is skipped
    /// when the view is replayed, and the rest of the batch still lands.
    pub fn insert_operations(&mut self, ops: impl IntoIterator<Item = Operation>) -> Vec<Oid> {
        let mut staged: BTreeMap<Oid, EntityLog> = BTreeMap::new();
        for op in ops {
            let log = staged
                .entry(op.oid.clone())
                .or_insert_with(|| self.entities.get(&op.oid).cloned().unwrap_or_default());
            log.insert(op);
        }
        self.commit(staged)
    }

    /// Replace an entity's baseline, dropping operations it covers.
    pub fn put_baseline(&mut self, baseline: DocumentBaseline) -> Vec<Oid> {
        let mut log = self.entities.get(&baseline.oid).cloned().unwrap_or_default();
        log.operations.retain(|op| op.timestamp > baseline.timestamp);
        let oid = baseline.oid.clone();
        log.baseline = Some(baseline);
        self.commit(BTreeMap::from([(oid, log)]))
    }

    fn commit(&mut self, staged: BTreeMap<Oid, EntityLog>) -> Vec<Oid> {
        let mut changed = Vec::new();
        for (oid, log) in staged {
            let view = log.view(&oid);
            self.entities.insert(oid.clone(), log);
            let previous = self.views.get(&oid);
            if previous == view.as_ref() {
                continue;
            }
            match view {
                Some(value) => self.views.insert(oid.clone(), value),
                None => self.views.remove(&oid),
            };
            changed.push(oid);
        }
        self.notify(&changed);
        changed
    }

    /// Current value of an entity, references left as tokens.
    pub fn view(&self, oid: &str) -> Option<&Value> {
        self.views.get(oid)
    }

    /// Current value with nested entity references inlined.
    pub fn hydrate(&self, oid: &str) -> Result<Option<Value>, ConvergentError> {
        let mut path = Vec::new();
        self.hydrate_inner(oid, &mut path)
    }

    fn hydrate_inner(&self, oid: &str, path: &mut Vec<Oid>) -> Result<Option<Value>, ConvergentError> {
        if path.iter().any(|seen| seen == oid) {
            return Err(ConvergentError::ReferenceCycle(oid.to_string()));
        }
        let Some(value) = self.views.get(oid) else {
            return Ok(None);
        };
        path.push(oid.to_string());
        let hydrated = self.inline_refs(value, path)?;
        path.pop();
        Ok(Some(hydrated))
    }

    fn inline_refs(&self, value: &Value, path: &mut Vec<Oid>) -> Result<Value, ConvergentError> {
        if let Some(child) = value.as_object_ref() {
            return Ok(self.hydrate_inner(child, path)?.unwrap_or(Value::Null));
        }
        Ok(match value {
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.inline_refs(item, path))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| -> Result<(String, Value), ConvergentError> {
                        Ok((k.clone(), self.inline_refs(v, path)?))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            other => other.clone(),
        })
    }

    pub fn baseline(&self, oid: &str) -> Option<&DocumentBaseline> {
        self.entities.get(oid).and_then(|log| log.baseline.as_ref())
    }

    /// Pending (not yet folded) operations of one entity, in timestamp order.
    pub fn operations_for(&self, oid: &str) -> &[Operation] {
        self.entities
            .get(oid)
            .map(|log| log.operations.as_slice())
            .unwrap_or(&[])
    }

    /// Every known OID under `root`, the root included.
    pub fn entity_oids_of_root(&self, root: &str) -> Vec<Oid> {
        let root = get_oid_root(root);
        let (lower, upper) = get_oid_sub_id_range(root);
        let mut oids: Vec<Oid> = self
            .entities
            .range(lower..=upper)
            .map(|(oid, _)| oid.clone())
            .filter(|oid| matches_root(oid, root))
            .collect();
        if self.entities.contains_key(root) {
            oids.insert(0, root.to_string());
        }
        oids
    }

    pub fn oids(&self) -> impl Iterator<Item = &Oid> {
        self.entities.keys()
    }

    /// All pending operations after `since` (everything when `None`), sorted.
    pub fn operations_after(&self, since: Option<&Timestamp>) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .entities
            .values()
            .flat_map(|log| log.operations.iter())
            .filter(|op| since.map_or(true, |s| op.timestamp > *s))
            .cloned()
            .collect();
        super::reconstruct::sort_operations(&mut ops);
        ops
    }

    pub fn baselines(&self) -> Vec<DocumentBaseline> {
        self.entities
            .values()
            .filter_map(|log| log.baseline.clone())
            .collect()
    }

    /// Fold an entity's operations up to `up_to` into its baseline. The view
    /// does not change.
    pub fn rebase(&mut self, oid: &str, up_to: &Timestamp) -> bool {
        let Some(log) = self.entities.get_mut(oid) else {
            return false;
        };
        if !log.operations.iter().any(|op| op.timestamp <= *up_to) {
            return false;
        }
        let baseline = fold_baseline(oid, log.baseline.as_ref(), &log.operations, up_to);
        log.operations.retain(|op| op.timestamp > *up_to);
        log.baseline = baseline;
        true
    }

    /// Drop a root and every entity under it from memory.
    pub fn purge_root(&mut self, root: &str) -> Vec<Oid> {
        let oids = self.entity_oids_of_root(root);
        for oid in &oids {
            self.entities.remove(oid);
        }
        let mut changed = Vec::new();
        for oid in &oids {
            if self.views.remove(oid).is_some() {
                changed.push(oid.clone());
            }
        }
        self.notify(&changed);
        oids
    }

    /// Forget everything. Subscribers are kept and told about each entity
    /// that disappears.
    pub fn clear(&mut self) {
        let changed: Vec<Oid> = self.views.keys().cloned().collect();
        self.entities.clear();
        self.views.clear();
        self.notify(&changed);
    }

    /// Register a callback for changes to `oid`. A root subscription also
    /// hears about every nested entity under that root.
    pub fn on_changed(&mut self, oid: impl Into<Oid>, callback: ChangeCallback) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers.insert(id, (oid.into(), callback));
        id
    }

    pub fn unsubscribe(&mut self, id: &Uuid) -> bool {
        self.subscribers.remove(id).is_some()
    }

    fn notify(&self, changed: &[Oid]) {
        for oid in changed {
            let view = self.views.get(oid);
            for (target, callback) in self.subscribers.values() {
                let hears = target == oid || (is_root_oid(target) && matches_root(oid, target));
                if hears {
                    callback(oid, view);
                }
            }
        }
    }
}

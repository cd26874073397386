//! The local replica store
//!
//! Ties the clock, the entity arena, the batching window and the undo stacks
//! together into the object an application (or a sync driver) talks to.
//! Local writes apply to the in-memory views immediately; the operations
//! produced are queued for the reconciler to push.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::{SchemaVersion, TimeAuthority, Timestamp};
use crate::config::SyncConfig;
use crate::convergent::{
    compute_undo_entry, ChangeCallback, ConvergentError, DocumentArena, DocumentBaseline, Operation,
    OperationBatcher, OperationData, UndoHistory, Value,
};
use crate::oid::{create_oid, create_sub_oid, Oid};

/// Notifications from the store.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// An entity's view changed (or it was deleted)
    Changed(Oid),
    /// Operations from a newer schema arrived and were set aside
    FutureDataSeen { version: SchemaVersion },
    /// Local state was discarded and replaced by the server's
    ResetToServer,
}

/// One replica's local document state.
pub struct ReplicaStore {
    clock: Arc<TimeAuthority>,
    schema_version: SchemaVersion,
    arena: DocumentArena,
    batcher: OperationBatcher,
    history: UndoHistory,
    /// Operations stamped with a schema newer than ours
    deferred: Vec<Operation>,
    events: broadcast::Sender<StoreEvent>,
}

impl ReplicaStore {
    pub fn new(clock: Arc<TimeAuthority>, schema_version: SchemaVersion, config: &SyncConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            clock,
            schema_version,
            arena: DocumentArena::new(),
            batcher: OperationBatcher::new(config.batch_window(), config.batch_max_size),
            history: UndoHistory::new(config.undo_history_limit),
            deferred: Vec::new(),
            events,
        }
    }

    pub fn clock(&self) -> &Arc<TimeAuthority> {
        &self.clock
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub fn arena(&self) -> &DocumentArena {
        &self.arena
    }

    /// Subscribe to store events.
    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now(self.schema_version)
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    /// Create a root document.
    pub fn create(&mut self, collection: &str, primary_key: &str, value: Value) -> Result<Oid, ConvergentError> {
        if primary_key.is_empty() {
            return Err(ConvergentError::MissingPrimaryKey(collection.to_string()));
        }
        let oid = create_oid(collection, primary_key, None)?;
        self.apply_local(vec![(oid.clone(), OperationData::initialize(value))])?;
        Ok(oid)
    }

    /// Create a nested entity under `parent`'s root. The caller links it in by
    /// storing `Value::object_ref(oid)` somewhere in the parent.
    pub fn create_nested(&mut self, parent: &str, value: Value) -> Result<Oid, ConvergentError> {
        let oid = create_sub_oid(parent);
        self.apply_local(vec![(oid.clone(), OperationData::initialize(value))])?;
        Ok(oid)
    }

    pub fn set(&mut self, oid: &str, name: &str, value: Value) -> Result<Vec<Operation>, ConvergentError> {
        self.apply_local(vec![(oid.to_string(), OperationData::set(name, value))])
    }

    pub fn remove(&mut self, oid: &str, name: &str) -> Result<Vec<Operation>, ConvergentError> {
        self.apply_local(vec![(oid.to_string(), OperationData::remove(name))])
    }

    pub fn push(&mut self, oid: &str, value: Value) -> Result<Vec<Operation>, ConvergentError> {
        self.apply_local(vec![(oid.to_string(), OperationData::list_push(value))])
    }

    /// Delete a document and every nested entity under it.
    pub fn delete_document(&mut self, root: &str) -> Result<Vec<Operation>, ConvergentError> {
        let changes: Vec<(Oid, OperationData)> = self
            .arena
            .entity_oids_of_root(root)
            .into_iter()
            .filter(|oid| self.arena.view(oid).is_some())
            .map(|oid| (oid, OperationData::Delete))
            .collect();
        self.apply_local(changes)
    }

    /// Stamp, apply and queue one local batch, recording its undo entry.
    pub fn apply_local(&mut self, changes: Vec<(Oid, OperationData)>) -> Result<Vec<Operation>, ConvergentError> {
        let ops: Vec<Operation> = changes
            .into_iter()
            .map(|(oid, data)| Operation::new(oid, self.now(), data))
            .collect();
        let entry = self.commit_local(&ops)?;
        self.history.record(entry);
        Ok(ops)
    }

    fn commit_local(&mut self, ops: &[Operation]) -> Result<crate::convergent::UndoEntry, ConvergentError> {
        let clock = Arc::clone(&self.clock);
        let version = self.schema_version;
        let arena = &self.arena;
        let entry = compute_undo_entry(|oid| arena.view(oid).cloned(), ops, || clock.now(version))?;
        let changed = self.arena.insert_operations(ops.iter().cloned());
        self.batcher.push(ops.iter().cloned());
        self.emit_changed(changed);
        Ok(entry)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Undo the most recent local batch by issuing its inverse as a new batch.
    pub fn undo(&mut self) -> Result<Option<Vec<Operation>>, ConvergentError> {
        let Some(entry) = self.history.take_undo() else {
            return Ok(None);
        };
        let ops = entry.restamp(|| self.clock.now(self.schema_version));
        let redo = self.commit_local(&ops)?;
        self.history.push_redo(redo);
        Ok(Some(ops))
    }

    pub fn redo(&mut self) -> Result<Option<Vec<Operation>>, ConvergentError> {
        let Some(entry) = self.history.take_redo() else {
            return Ok(None);
        };
        let ops = entry.restamp(|| self.clock.now(self.schema_version));
        let undo = self.commit_local(&ops)?;
        self.history.push_undo_from_redo(undo);
        Ok(Some(ops))
    }

    /// Take the queued local operations, compressed.
    pub fn take_outgoing(&mut self) -> Vec<Operation> {
        self.batcher.flush()
    }

    /// Whether the batching window for queued writes has passed (or the batch
    /// is full).
    pub fn outgoing_due(&self, now: Instant) -> bool {
        self.batcher.is_due(now)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.batcher.is_empty()
    }

    // -----------------------------------------------------------------------
    // Remote data
    // -----------------------------------------------------------------------

    /// Merge operations from other replicas. Operations from a newer schema
    /// are held back until this replica migrates. An operation that conflicts
    /// with its entity's history is kept and skipped on replay, like on every
    /// other replica.
    pub fn apply_remote(&mut self, ops: Vec<Operation>) -> Vec<Oid> {
        let mut current = Vec::with_capacity(ops.len());
        let mut newest_future = None;
        for op in ops {
            self.clock.update(&op.timestamp);
            let version = op.timestamp.version();
            if version > self.schema_version {
                newest_future = newest_future.max(Some(version));
                self.deferred.push(op);
            } else {
                current.push(op);
            }
        }
        if let Some(version) = newest_future {
            log::info!(
                "Deferring operations from schema version {} (local version {})",
                version,
                self.schema_version
            );
            let _ = self.events.send(StoreEvent::FutureDataSeen { version });
        }
        let changed = self.arena.insert_operations(current);
        self.emit_changed(changed.clone());
        changed
    }

    pub fn apply_baselines(&mut self, baselines: Vec<DocumentBaseline>) -> Vec<Oid> {
        let mut changed = Vec::new();
        for baseline in baselines {
            self.clock.update(&baseline.timestamp);
            changed.extend(self.arena.put_baseline(baseline));
        }
        self.emit_changed(changed.clone());
        changed
    }

    /// Fold acknowledged operations of one entity into its baseline. Skipped
    /// while deferred operations for that entity would fall under the fold.
    pub fn rebase(&mut self, oid: &str, up_to: &Timestamp) -> bool {
        let blocked = self
            .deferred
            .iter()
            .any(|op| op.oid == oid && op.timestamp <= *up_to);
        if blocked {
            return false;
        }
        self.arena.rebase(oid, up_to)
    }

    /// Discard all local state and adopt the server's.
    pub fn reset_to_server(&mut self, baselines: Vec<DocumentBaseline>, ops: Vec<Operation>) {
        log::info!("Resetting local replica to server state");
        self.arena.clear();
        self.batcher.clear();
        self.history.clear();
        self.deferred.clear();
        self.apply_baselines(baselines);
        self.apply_remote(ops);
        let _ = self.events.send(StoreEvent::ResetToServer);
    }

    /// Move to a newer schema version and release the operations deferred for
    /// it.
    pub fn set_schema_version(&mut self, version: SchemaVersion) -> Vec<Oid> {
        self.schema_version = self.schema_version.max(version);
        let (ready, still_future): (Vec<Operation>, Vec<Operation>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|op| op.timestamp.version() <= self.schema_version);
        self.deferred = still_future;
        let changed = self.arena.insert_operations(ready);
        self.emit_changed(changed.clone());
        changed
    }

    /// Insert operations produced by a migration (already stamped) and queue
    /// them for upload. They are not undoable.
    pub(crate) fn apply_migration(&mut self, ops: Vec<Operation>) -> Vec<Oid> {
        let changed = self.arena.insert_operations(ops.iter().cloned());
        self.batcher.push(ops);
        self.emit_changed(changed.clone());
        changed
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn view(&self, oid: &str) -> Option<Value> {
        self.arena.view(oid).cloned()
    }

    pub fn hydrate(&self, oid: &str) -> Result<Option<Value>, ConvergentError> {
        self.arena.hydrate(oid)
    }

    /// Every operation still in the local log after `since`.
    pub fn operations_after(&self, since: Option<&Timestamp>) -> Vec<Operation> {
        self.arena.operations_after(since)
    }

    pub fn on_changed(&mut self, oid: impl Into<Oid>, callback: ChangeCallback) -> Uuid {
        self.arena.on_changed(oid, callback)
    }

    pub fn unsubscribe(&mut self, id: &Uuid) -> bool {
        self.arena.unsubscribe(id)
    }

    fn emit_changed(&self, changed: Vec<Oid>) {
        for oid in changed {
            let _ = self.events.send(StoreEvent::Changed(oid));
        }
    }
}

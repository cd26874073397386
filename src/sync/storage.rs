//! Server-side persistence
//!
//! `SyncStorage` is the seam between the reconciler and whatever holds the
//! authoritative log. `MemoryStorage` keeps everything in memory and can
//! snapshot itself to a JSON file.
//!
//! Every logged operation remembers the server stamp it arrived under.
//! Replicas write their own timestamps, so an operation made offline can
//! reach the server long after others that sort later; delivery and
//! compaction follow arrival, replay follows operation timestamps.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::replica::ReplicaInfo;
use super::StorageError;
use crate::clock::{SchemaVersion, Timestamp};
use crate::convergent::{fold_baseline, sort_operations, DocumentBaseline, Operation};
use crate::oid::{get_oid_root, is_root_oid, matches_root, Oid};

const STATE_FILE: &str = "sync_state.json";

#[async_trait]
pub trait SyncStorage: Send + Sync {
    async fn get_baseline(&self, oid: &str) -> Result<Option<DocumentBaseline>, StorageError>;

    /// Baselines of every entity, or of every entity under `root`.
    async fn get_baselines(&self, root: Option<&str>) -> Result<Vec<DocumentBaseline>, StorageError>;

    async fn put_baseline(&self, baseline: DocumentBaseline) -> Result<(), StorageError>;

    /// Store operations that arrived under the server stamp `received`,
    /// idempotently on `(oid, timestamp)`. Operations already covered by a
    /// baseline are dropped. Returns the operations that were new.
    async fn insert_operations(
        &self,
        ops: Vec<Operation>,
        received: &Timestamp,
    ) -> Result<Vec<Operation>, StorageError>;

    /// Operations that arrived after the server stamp `received_after` (all
    /// when `None`), for one entity, every entity under a root, or
    /// everything. Sorted by operation timestamp.
    async fn get_operations(
        &self,
        oid_or_root: Option<&str>,
        received_after: Option<&Timestamp>,
    ) -> Result<Vec<Operation>, StorageError>;

    /// Delete the operations of one entity, or of every entity under a root,
    /// at or before `up_to` (all of them when `None`).
    async fn delete_operations(&self, oid_or_root: &str, up_to: Option<&Timestamp>) -> Result<usize, StorageError>;

    /// How far each entity can be folded once every replica holds what
    /// arrived up to `received_up_to`: the last timestamp of the longest
    /// timestamp-ordered run of operations that all arrived by then and were
    /// issued at or below `max_version`. Entities with no such run are left
    /// out.
    async fn rebase_points(
        &self,
        received_up_to: &Timestamp,
        max_version: SchemaVersion,
    ) -> Result<Vec<(Oid, Timestamp)>, StorageError>;

    async fn get_replica(&self, id: &str) -> Result<Option<ReplicaInfo>, StorageError>;

    async fn upsert_replica(&self, replica: ReplicaInfo) -> Result<(), StorageError>;

    /// Every known replica, leaving out those last seen before
    /// `exclude_seen_before` when given.
    async fn get_all_replicas(
        &self,
        exclude_seen_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReplicaInfo>, StorageError>;

    /// Fold an entity's operations up to `up_to` into a new baseline and
    /// delete them, as one step. Returns whether anything was folded.
    async fn rebase(&self, oid: &str, up_to: &Timestamp) -> Result<bool, StorageError>;
}

/// An operation as logged, with the server stamp it arrived under.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoggedOperation {
    op: Operation,
    received: Timestamp,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StorageState {
    baselines: BTreeMap<Oid, DocumentBaseline>,
    /// Per entity, sorted by operation timestamp
    operations: BTreeMap<Oid, Vec<LoggedOperation>>,
    replicas: HashMap<String, ReplicaInfo>,
}

impl StorageState {
    fn covers(&self, root: Option<&str>, oid: &str) -> bool {
        match root {
            None => true,
            Some(target) if is_root_oid(target) => matches_root(oid, target),
            Some(target) => oid == target,
        }
    }
}

/// In-memory storage behind an async mutex.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<StorageState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the full state to `dir`.
    pub async fn persist(&self, dir: &Path) -> Result<(), StorageError> {
        let state = self.state.lock().await;
        std::fs::create_dir_all(dir).map_err(|e| StorageError::IoError(e.to_string()))?;
        let json = serde_json::to_string_pretty(&*state)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        std::fs::write(dir.join(STATE_FILE), json).map_err(|e| StorageError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Load state written by `persist`. A missing file yields empty storage.
    pub fn load(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(&path).map_err(|e| StorageError::IoError(e.to_string()))?;
        let state: StorageState = serde_json::from_slice(&data)
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    async fn get_baseline(&self, oid: &str) -> Result<Option<DocumentBaseline>, StorageError> {
        Ok(self.state.lock().await.baselines.get(oid).cloned())
    }

    async fn get_baselines(&self, root: Option<&str>) -> Result<Vec<DocumentBaseline>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .baselines
            .values()
            .filter(|b| state.covers(root, &b.oid))
            .cloned()
            .collect())
    }

    async fn put_baseline(&self, baseline: DocumentBaseline) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if let Some(ops) = state.operations.get_mut(&baseline.oid) {
            ops.retain(|logged| logged.op.timestamp > baseline.timestamp);
        }
        state.baselines.insert(baseline.oid.clone(), baseline);
        Ok(())
    }

    async fn insert_operations(
        &self,
        ops: Vec<Operation>,
        received: &Timestamp,
    ) -> Result<Vec<Operation>, StorageError> {
        let mut state = self.state.lock().await;
        let mut inserted = Vec::new();
        for op in ops {
            let floor = state.baselines.get(&op.oid).map(|b| b.timestamp.clone());
            if floor.as_ref().is_some_and(|f| op.timestamp <= *f) {
                log::warn!(
                    "Dropping operation on {} at {}: already folded into baseline",
                    op.oid,
                    op.timestamp
                );
                continue;
            }
            let entries = state.operations.entry(op.oid.clone()).or_default();
            match entries.binary_search_by(|existing| existing.op.timestamp.cmp(&op.timestamp)) {
                Ok(_) => continue,
                Err(pos) => {
                    entries.insert(
                        pos,
                        LoggedOperation {
                            op: op.clone(),
                            received: received.clone(),
                        },
                    );
                    inserted.push(op);
                }
            }
        }
        Ok(inserted)
    }

    async fn get_operations(
        &self,
        oid_or_root: Option<&str>,
        received_after: Option<&Timestamp>,
    ) -> Result<Vec<Operation>, StorageError> {
        let state = self.state.lock().await;
        let after = received_after.map(Timestamp::tick);
        let mut ops: Vec<Operation> = state
            .operations
            .iter()
            .filter(|(oid, _)| state.covers(oid_or_root, oid))
            .flat_map(|(_, entries)| entries.iter())
            .filter(|logged| after.map_or(true, |a| logged.received.tick() > a))
            .map(|logged| logged.op.clone())
            .collect();
        sort_operations(&mut ops);
        Ok(ops)
    }

    async fn delete_operations(&self, oid_or_root: &str, up_to: Option<&Timestamp>) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let target = Some(oid_or_root);
        let oids: Vec<Oid> = state
            .operations
            .keys()
            .filter(|oid| state.covers(target, oid))
            .cloned()
            .collect();
        let mut removed = 0;
        for oid in oids {
            let Some(entries) = state.operations.get_mut(&oid) else {
                continue;
            };
            let before = entries.len();
            entries.retain(|logged| up_to.map_or(false, |u| logged.op.timestamp > *u));
            removed += before - entries.len();
            if entries.is_empty() {
                state.operations.remove(&oid);
            }
        }
        Ok(removed)
    }

    async fn rebase_points(
        &self,
        received_up_to: &Timestamp,
        max_version: SchemaVersion,
    ) -> Result<Vec<(Oid, Timestamp)>, StorageError> {
        let state = self.state.lock().await;
        let limit = received_up_to.tick();
        Ok(state
            .operations
            .iter()
            .filter_map(|(oid, entries)| {
                entries
                    .iter()
                    .take_while(|logged| {
                        logged.received.tick() <= limit && logged.op.timestamp.version() <= max_version
                    })
                    .last()
                    .map(|logged| (oid.clone(), logged.op.timestamp.clone()))
            })
            .collect())
    }

    async fn get_replica(&self, id: &str) -> Result<Option<ReplicaInfo>, StorageError> {
        Ok(self.state.lock().await.replicas.get(id).cloned())
    }

    async fn upsert_replica(&self, replica: ReplicaInfo) -> Result<(), StorageError> {
        self.state
            .lock()
            .await
            .replicas
            .insert(replica.id.clone(), replica);
        Ok(())
    }

    async fn get_all_replicas(
        &self,
        exclude_seen_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReplicaInfo>, StorageError> {
        let state = self.state.lock().await;
        let mut replicas: Vec<ReplicaInfo> = state
            .replicas
            .values()
            .filter(|r| exclude_seen_before.map_or(true, |cutoff| r.last_seen_wall_clock_time >= cutoff))
            .cloned()
            .collect();
        replicas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(replicas)
    }

    async fn rebase(&self, oid: &str, up_to: &Timestamp) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        let ops: Vec<Operation> = state
            .operations
            .get(oid)
            .map(|entries| entries.iter().map(|logged| logged.op.clone()).collect())
            .unwrap_or_default();
        if !ops.iter().any(|op| op.timestamp <= *up_to) {
            return Ok(false);
        }
        if let Some(baseline) = fold_baseline(oid, state.baselines.get(oid), &ops, up_to) {
            state.baselines.insert(oid.to_string(), baseline);
        }
        if let Some(entries) = state.operations.get_mut(oid) {
            entries.retain(|logged| logged.op.timestamp > *up_to);
            if entries.is_empty() {
                state.operations.remove(oid);
            }
        }
        log::debug!("Rebased {} (root {}) up to {}", oid, get_oid_root(oid), up_to);
        Ok(true)
    }
}

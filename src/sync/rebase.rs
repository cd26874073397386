//! Compaction of acknowledged history
//!
//! A replica acknowledges a server stamp once it holds every operation that
//! reached the server by then. The smallest such stamp across live replicas
//! bounds what everyone holds. Within each entity, the operations that sort
//! before anything still outside that bound are folded into baselines on the
//! server and on every client. Replicas only upload history newer than their
//! own acknowledgement, so nothing can later arrive below a fold.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::message::RebaseNotice;
use super::replica::ReplicaInfo;
use super::storage::SyncStorage;
use super::StorageError;
use crate::clock::{SchemaVersion, Timestamp};

fn gates_compaction(replica: &ReplicaInfo, now: DateTime<Utc>, threshold: Duration) -> bool {
    replica.replica_type.counts_toward_ack() && !replica.is_truant(now, threshold)
}

/// The smallest acknowledged stamp, in server tick order, across the
/// replicas that gate compaction.
///
/// Passive and truant replicas are ignored. Returns `None` when no replica
/// counts or when a counted replica has never acknowledged anything.
pub fn compute_global_ack(replicas: &[ReplicaInfo], now: DateTime<Utc>, threshold: Duration) -> Option<Timestamp> {
    let mut global: Option<&Timestamp> = None;
    for replica in replicas {
        if !gates_compaction(replica, now, threshold) {
            continue;
        }
        let acked = replica.acked_logical_time.as_ref()?;
        global = Some(match global {
            Some(current) if current.tick() <= acked.tick() => current,
            _ => acked,
        });
    }
    global.cloned()
}

/// The oldest schema version any replica that gates compaction still runs.
pub fn live_schema_version(replicas: &[ReplicaInfo], now: DateTime<Utc>, threshold: Duration) -> Option<SchemaVersion> {
    replicas
        .iter()
        .filter(|r| gates_compaction(r, now, threshold))
        .map(|r| r.schema_version)
        .min()
}

/// Runs server-side compaction.
pub struct RebaseCoordinator {
    storage: Arc<dyn SyncStorage>,
    truancy_threshold: Duration,
}

impl RebaseCoordinator {
    pub fn new(storage: Arc<dyn SyncStorage>, truancy_threshold: Duration) -> Self {
        Self {
            storage,
            truancy_threshold,
        }
    }

    /// The current global acknowledgement.
    pub async fn global_ack(&self, now: DateTime<Utc>) -> Result<Option<Timestamp>, StorageError> {
        let replicas = self.storage.get_all_replicas(None).await?;
        Ok(compute_global_ack(&replicas, now, self.truancy_threshold))
    }

    /// Fold what every live replica holds. Returns a notice per entity
    /// compacted, for broadcasting to clients.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Vec<RebaseNotice>, StorageError> {
        let replicas = self.storage.get_all_replicas(None).await?;
        let (Some(acked), Some(version)) = (
            compute_global_ack(&replicas, now, self.truancy_threshold),
            live_schema_version(&replicas, now, self.truancy_threshold),
        ) else {
            return Ok(Vec::new());
        };
        let mut notices = Vec::new();
        for (oid, up_to) in self.storage.rebase_points(&acked, version).await? {
            if self.storage.rebase(&oid, &up_to).await? {
                notices.push(RebaseNotice { oid, up_to });
            }
        }
        if !notices.is_empty() {
            log::debug!("Rebased {} entities held by every replica as of {}", notices.len(), acked);
        }
        Ok(notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;
    use crate::convergent::{Operation, OperationData, Value};
    use crate::sync::replica::ReplicaType;
    use crate::sync::storage::MemoryStorage;

    const THRESHOLD: Duration = Duration::from_secs(3600);

    fn replica(id: &str, replica_type: ReplicaType, acked: Option<&Timestamp>) -> ReplicaInfo {
        let mut info = ReplicaInfo::new(id, "u", replica_type, Utc::now());
        info.acked_logical_time = acked.cloned();
        info
    }

    #[test]
    fn test_global_ack_is_minimum_of_live_replicas() {
        let clock = TimeAuthority::new("s");
        let t1 = clock.now(1);
        let t2 = clock.now(1);
        let now = Utc::now();

        let replicas = vec![
            replica("a", ReplicaType::Realtime, Some(&t2)),
            replica("b", ReplicaType::Pull, Some(&t1)),
            replica("p", ReplicaType::Passive, None),
        ];
        assert_eq!(compute_global_ack(&replicas, now, THRESHOLD), Some(t1.clone()));

        let mut with_unacked = replicas.clone();
        with_unacked.push(replica("c", ReplicaType::Realtime, None));
        assert_eq!(compute_global_ack(&with_unacked, now, THRESHOLD), None);

        // a truant replica no longer holds compaction back
        let mut truant = replica("c", ReplicaType::Realtime, None);
        truant.last_seen_wall_clock_time = now - chrono::Duration::hours(2);
        truant.schema_version = 0;
        let mut with_truant = replicas;
        with_truant.push(truant);
        assert_eq!(compute_global_ack(&with_truant, now, THRESHOLD), Some(t1));
        assert_eq!(live_schema_version(&with_truant, now, THRESHOLD), Some(1));

        assert_eq!(compute_global_ack(&[], now, THRESHOLD), None);
        assert_eq!(live_schema_version(&[], now, THRESHOLD), None);
    }

    #[test]
    fn test_global_ack_uses_server_tick_order() {
        let clock = TimeAuthority::new("s");
        let under_new_schema = clock.now(2);
        let under_old_schema = clock.now(1);
        let replicas = vec![
            replica("a", ReplicaType::Realtime, Some(&under_old_schema)),
            replica("b", ReplicaType::Realtime, Some(&under_new_schema)),
        ];
        assert_eq!(compute_global_ack(&replicas, Utc::now(), THRESHOLD), Some(under_new_schema));
    }

    #[tokio::test]
    async fn test_run_folds_what_every_replica_holds() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = TimeAuthority::new("a");
        let server = TimeAuthority::new("server");
        let ops = vec![
            Operation::new("items/a", clock.now(1), OperationData::initialize(Value::empty_map())),
            Operation::new("items/a", clock.now(1), OperationData::set("n", Value::int(1))),
            Operation::new("items/a", clock.now(1), OperationData::set("n", Value::int(2))),
        ];
        let first = server.now(1);
        storage.insert_operations(ops[..2].to_vec(), &first).await.unwrap();
        storage.insert_operations(ops[2..].to_vec(), &server.now(1)).await.unwrap();
        storage
            .upsert_replica(replica("a", ReplicaType::Realtime, Some(&first)))
            .await
            .unwrap();

        let coordinator = RebaseCoordinator::new(storage.clone(), THRESHOLD);
        let notices = coordinator.run(Utc::now()).await.unwrap();
        assert_eq!(
            notices,
            vec![RebaseNotice {
                oid: "items/a".into(),
                up_to: ops[1].timestamp.clone(),
            }]
        );

        let baseline = storage.get_baseline("items/a").await.unwrap().unwrap();
        assert_eq!(baseline.snapshot, Some(Value::map([("n", Value::int(1))])));
        assert_eq!(storage.get_operations(None, None).await.unwrap(), vec![ops[2].clone()]);

        // nothing new to fold
        assert!(coordinator.run(Utc::now()).await.unwrap().is_empty());
    }
}

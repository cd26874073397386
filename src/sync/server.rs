//! Server side of the reconciler
//!
//! `ServerSync` turns one client message into the messages that must go out
//! in response. It does no I/O of its own beyond the storage collaborator;
//! `transport::SyncHub` routes what it returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::message::{ClientMessage, ServerMessage};
use super::presence::{PresenceRegistry, UserInfo};
use super::rebase::{live_schema_version, RebaseCoordinator};
use super::replica::{ReplicaInfo, ReplicaType};
use super::storage::SyncStorage;
use super::SyncError;
use crate::clock::{SchemaVersion, TimeAuthority, Timestamp};
use crate::config::SyncConfig;
use crate::convergent::Value;

/// Who an outgoing message is for.
#[derive(Debug, Clone, PartialEq)]
pub enum Recipient {
    /// The replica whose message is being handled
    Reply,
    Replicas(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub to: Recipient,
    pub message: ServerMessage,
}

impl Outgoing {
    fn reply(message: ServerMessage) -> Self {
        Self {
            to: Recipient::Reply,
            message,
        }
    }
}

pub struct ServerSync {
    storage: Arc<dyn SyncStorage>,
    clock: Arc<TimeAuthority>,
    config: SyncConfig,
    rebaser: RebaseCoordinator,
    presence: PresenceRegistry,
    /// Replicas with a live connection
    connected: BTreeMap<String, ReplicaType>,
}

impl ServerSync {
    pub fn new(storage: Arc<dyn SyncStorage>, clock: Arc<TimeAuthority>, config: SyncConfig) -> Self {
        let rebaser = RebaseCoordinator::new(Arc::clone(&storage), config.truancy_threshold());
        Self {
            storage,
            clock,
            config,
            rebaser,
            presence: PresenceRegistry::new(),
            connected: BTreeMap::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.storage
    }

    pub fn is_connected(&self, replica_id: &str) -> bool {
        self.connected.contains_key(replica_id)
    }

    /// Stamp a server message or a batch of arriving operations. Stamps carry
    /// the oldest schema version among live replicas; the server orders its
    /// own stamps by tick, which keeps increasing when that version drops.
    async fn stamp(&self, now: DateTime<Utc>) -> Result<Timestamp, SyncError> {
        let replicas = self.storage.get_all_replicas(None).await?;
        let version: SchemaVersion =
            live_schema_version(&replicas, now, self.config.truancy_threshold()).unwrap_or(1);
        Ok(self.clock.now(version))
    }

    fn peers_of(&self, replica_id: &str, relays_only: bool) -> Vec<String> {
        self.connected
            .iter()
            .filter(|(id, kind)| id.as_str() != replica_id && (!relays_only || kind.receives_relays()))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Handle one message from a replica.
    pub async fn handle(&mut self, message: ClientMessage, now: DateTime<Utc>) -> Result<Vec<Outgoing>, SyncError> {
        match message {
            ClientMessage::Sync {
                replica_id,
                user_id,
                replica_type,
                schema_version,
                timestamp,
                since,
                resync_all,
            } => {
                self.clock.update(&timestamp);
                self.handle_sync(replica_id, user_id, replica_type, schema_version, since, resync_all, now)
                    .await
            }
            ClientMessage::Op {
                replica_id,
                operations,
                oldest_history_timestamp,
            } => self.handle_op(replica_id, operations, oldest_history_timestamp, now).await,
            ClientMessage::Ack {
                replica_id,
                timestamp,
                ..
            } => self.handle_ack(replica_id, timestamp, now).await,
            ClientMessage::Heartbeat { replica_id, timestamp } => {
                self.clock.update(&timestamp);
                let mut replica = self.known_replica(&replica_id).await?;
                replica.touch(now);
                self.storage.upsert_replica(replica).await?;
                Ok(vec![Outgoing::reply(ServerMessage::HeartbeatResponse {
                    timestamp: self.stamp(now).await?,
                })])
            }
            ClientMessage::PresenceUpdate {
                replica_id,
                presence,
                internal,
            } => self.handle_presence(replica_id, presence, internal).await,
        }
    }

    async fn known_replica(&self, replica_id: &str) -> Result<ReplicaInfo, SyncError> {
        if !self.connected.contains_key(replica_id) {
            return Err(SyncError::UnknownReplica(replica_id.to_string()));
        }
        self.storage
            .get_replica(replica_id)
            .await?
            .ok_or_else(|| SyncError::UnknownReplica(replica_id.to_string()))
    }

    async fn handle_sync(
        &mut self,
        replica_id: String,
        user_id: String,
        replica_type: ReplicaType,
        schema_version: SchemaVersion,
        since: Option<Timestamp>,
        resync_all: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outgoing>, SyncError> {
        let threshold = self.config.truancy_threshold();
        let existing = self.storage.get_replica(&replica_id).await?;
        let truant = existing
            .as_ref()
            .is_some_and(|r| r.is_truant(now, threshold));

        let mut replica = existing.unwrap_or_else(|| ReplicaInfo::new(&replica_id, &user_id, replica_type, now));
        let first_sync = replica.last_synced_logical_time.is_none() || since.is_none();
        let full = first_sync || truant || resync_all;

        if truant {
            log::info!("Replica {} is truant, resetting it to server state", replica_id);
            replica.acked_logical_time = None;
        }

        // Collected before stamping: the stamp covers everything sent here.
        let (operations, baselines) = if full {
            (
                self.storage.get_operations(None, None).await?,
                self.storage.get_baselines(None).await?,
            )
        } else {
            (self.storage.get_operations(None, since.as_ref()).await?, Vec::new())
        };

        replica.user_id = user_id;
        replica.replica_type = replica_type;
        replica.schema_version = schema_version;
        replica.touch(now);
        self.storage.upsert_replica(replica.clone()).await?;

        let timestamp = self.stamp(now).await?;
        replica.last_synced_logical_time = Some(timestamp.clone());
        let provide_changes_since = if first_sync {
            None
        } else {
            replica.acked_logical_time.clone()
        };
        self.storage.upsert_replica(replica).await?;
        self.connected.insert(replica_id.clone(), replica_type);

        log::debug!(
            "Sync from {}: {} operations, {} baselines (full: {})",
            replica_id,
            operations.len(),
            baselines.len(),
            full
        );

        Ok(vec![Outgoing::reply(ServerMessage::SyncResp {
            timestamp,
            operations,
            baselines,
            provide_changes_since,
            global_ack_timestamp: self.rebaser.global_ack(now).await?,
            peer_presence: self.presence.peers_of(&replica_id),
            reset_to_server: truant,
        })])
    }

    async fn handle_op(
        &mut self,
        replica_id: String,
        operations: Vec<crate::convergent::Operation>,
        oldest_history: Timestamp,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outgoing>, SyncError> {
        let mut replica = self.known_replica(&replica_id).await?;
        if !replica.replica_type.can_write() {
            return Err(SyncError::ReadOnly(replica_id));
        }
        for op in &operations {
            self.clock.update(&op.timestamp);
        }
        log::debug!(
            "{} operations from {} with history back to {}",
            operations.len(),
            replica_id,
            oldest_history
        );
        // Sorts after every operation in the batch, in tick order.
        let received = self.stamp(now).await?;
        let inserted = self.storage.insert_operations(operations, &received).await?;
        replica.touch(now);
        self.storage.upsert_replica(replica).await?;

        if inserted.is_empty() {
            return Ok(Vec::new());
        }
        let peers = self.peers_of(&replica_id, true);
        if peers.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Outgoing {
            to: Recipient::Replicas(peers),
            message: ServerMessage::OpRe {
                timestamp: received,
                operations: inserted,
                global_ack_timestamp: self.rebaser.global_ack(now).await?,
            },
        }])
    }

    async fn handle_ack(
        &mut self,
        replica_id: String,
        timestamp: Timestamp,
        now: DateTime<Utc>,
    ) -> Result<Vec<Outgoing>, SyncError> {
        let mut replica = self.known_replica(&replica_id).await?;
        let advanced = replica.acknowledge(&timestamp);
        replica.touch(now);
        self.storage.upsert_replica(replica).await?;
        if advanced && self.config.rebase_on_ack {
            return self.rebase(now).await;
        }
        Ok(Vec::new())
    }

    /// Run compaction and tell every connected replica what was folded.
    pub async fn rebase(&mut self, now: DateTime<Utc>) -> Result<Vec<Outgoing>, SyncError> {
        let rebases = self.rebaser.run(now).await?;
        if rebases.is_empty() || self.connected.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Outgoing {
            to: Recipient::Replicas(self.connected.keys().cloned().collect()),
            message: ServerMessage::Rebases { rebases },
        }])
    }

    async fn handle_presence(
        &mut self,
        replica_id: String,
        presence: Value,
        internal: Option<Value>,
    ) -> Result<Vec<Outgoing>, SyncError> {
        let replica = self.known_replica(&replica_id).await?;
        let user_info = self
            .presence
            .update(UserInfo {
                replica_id: replica_id.clone(),
                user_id: replica.user_id,
                presence,
                internal,
            })
            .clone();
        let peers = self.peers_of(&replica_id, false);
        if peers.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Outgoing {
            to: Recipient::Replicas(peers),
            message: ServerMessage::PresenceChanged { replica_id, user_info },
        }])
    }

    /// A replica's connection closed (or stopped answering heartbeats).
    pub async fn disconnect(&mut self, replica_id: &str) -> Result<Vec<Outgoing>, SyncError> {
        if self.connected.remove(replica_id).is_none() {
            return Ok(Vec::new());
        }
        self.presence.remove(replica_id);
        let user_id = match self.storage.get_replica(replica_id).await? {
            Some(replica) => replica.user_id,
            None => String::new(),
        };
        let peers = self.peers_of(replica_id, false);
        if peers.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Outgoing {
            to: Recipient::Replicas(peers),
            message: ServerMessage::PresenceOffline {
                replica_id: replica_id.to_string(),
                user_id,
            },
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{Operation, OperationData};
    use crate::sync::storage::MemoryStorage;

    fn server() -> ServerSync {
        ServerSync::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(TimeAuthority::new("server")),
            SyncConfig::default(),
        )
    }

    fn sync(replica: &str, replica_type: ReplicaType, since: Option<Timestamp>) -> ClientMessage {
        ClientMessage::Sync {
            replica_id: replica.into(),
            user_id: format!("user-{}", replica),
            replica_type,
            schema_version: 1,
            timestamp: TimeAuthority::zero(1),
            since,
            resync_all: false,
        }
    }

    fn sync_resp(out: Vec<Outgoing>) -> ServerMessage {
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, Recipient::Reply);
        out.into_iter().next().unwrap().message
    }

    #[tokio::test]
    async fn test_first_sync_registers_replica() {
        let mut server = server();
        let now = Utc::now();
        let out = server.handle(sync("a", ReplicaType::Realtime, None), now).await.unwrap();
        match sync_resp(out) {
            ServerMessage::SyncResp {
                provide_changes_since,
                reset_to_server,
                operations,
                ..
            } => {
                assert!(provide_changes_since.is_none());
                assert!(!reset_to_server);
                assert!(operations.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.is_connected("a"));
        let info = server.storage().get_replica("a").await.unwrap().unwrap();
        assert!(info.last_synced_logical_time.is_some());
    }

    #[tokio::test]
    async fn test_ops_relay_to_realtime_peers_only() {
        let mut server = server();
        let now = Utc::now();
        server.handle(sync("a", ReplicaType::Realtime, None), now).await.unwrap();
        server.handle(sync("b", ReplicaType::Realtime, None), now).await.unwrap();
        server.handle(sync("c", ReplicaType::Pull, None), now).await.unwrap();

        let clock = TimeAuthority::new("a");
        let op = Operation::new("items/1", clock.now(1), OperationData::initialize(Value::empty_map()));
        let msg = ClientMessage::Op {
            replica_id: "a".into(),
            operations: vec![op.clone()],
            oldest_history_timestamp: op.timestamp.clone(),
        };
        let out = server.handle(msg.clone(), now).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, Recipient::Replicas(vec!["b".into()]));
        match &out[0].message {
            ServerMessage::OpRe { operations, .. } => assert_eq!(operations, &vec![op]),
            other => panic!("unexpected {:?}", other),
        }

        // duplicates are not relayed again
        assert!(server.handle(msg, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_and_unknown_replicas_rejected() {
        let mut server = server();
        let now = Utc::now();
        server.handle(sync("r", ReplicaType::ReadOnlyRealtime, None), now).await.unwrap();
        let op = ClientMessage::Op {
            replica_id: "r".into(),
            operations: Vec::new(),
            oldest_history_timestamp: TimeAuthority::zero(1),
        };
        assert!(matches!(server.handle(op, now).await, Err(SyncError::ReadOnly(_))));

        let heartbeat = ClientMessage::Heartbeat {
            replica_id: "ghost".into(),
            timestamp: TimeAuthority::zero(1),
        };
        assert!(matches!(
            server.handle(heartbeat, now).await,
            Err(SyncError::UnknownReplica(_))
        ));
    }

    #[tokio::test]
    async fn test_acks_trigger_rebase_broadcast() {
        let mut server = server();
        let now = Utc::now();
        server.handle(sync("a", ReplicaType::Realtime, None), now).await.unwrap();

        let clock = TimeAuthority::new("a");
        let op = Operation::new("items/1", clock.now(1), OperationData::initialize(Value::empty_map()));
        server
            .handle(
                ClientMessage::Op {
                    replica_id: "a".into(),
                    operations: vec![op.clone()],
                    oldest_history_timestamp: op.timestamp.clone(),
                },
                now,
            )
            .await
            .unwrap();

        // the operation's own timestamp predates its arrival and covers nothing
        let early_ack = ClientMessage::Ack {
            replica_id: "a".into(),
            timestamp: op.timestamp.clone(),
            nonce: None,
        };
        assert!(server.handle(early_ack, now).await.unwrap().is_empty());
        assert!(server.storage().get_baseline("items/1").await.unwrap().is_none());

        let out = server
            .handle(
                ClientMessage::Ack {
                    replica_id: "a".into(),
                    timestamp: server.clock.now(1),
                    nonce: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].message {
            ServerMessage::Rebases { rebases } => {
                assert_eq!(rebases[0].oid, "items/1");
                assert_eq!(rebases[0].up_to, op.timestamp);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.storage().get_baseline("items/1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_truant_replica_is_reset() {
        let mut server = server();
        let then = Utc::now();
        let out = server.handle(sync("a", ReplicaType::Realtime, None), then).await.unwrap();
        let since = match sync_resp(out) {
            ServerMessage::SyncResp { timestamp, .. } => timestamp,
            other => panic!("unexpected {:?}", other),
        };
        server.disconnect("a").await.unwrap();

        // back within the threshold: incremental
        let soon = then + chrono::Duration::days(1);
        let out = server
            .handle(sync("a", ReplicaType::Realtime, Some(since.clone())), soon)
            .await
            .unwrap();
        assert!(matches!(
            sync_resp(out),
            ServerMessage::SyncResp { reset_to_server: false, .. }
        ));

        // gone for longer than the threshold: reset
        let later = soon + chrono::Duration::days(30);
        let out = server
            .handle(sync("a", ReplicaType::Realtime, Some(since)), later)
            .await
            .unwrap();
        assert!(matches!(
            sync_resp(out),
            ServerMessage::SyncResp { reset_to_server: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_presence_broadcast_and_offline() {
        let mut server = server();
        let now = Utc::now();
        server.handle(sync("a", ReplicaType::Realtime, None), now).await.unwrap();
        server.handle(sync("b", ReplicaType::Realtime, None), now).await.unwrap();

        let out = server
            .handle(
                ClientMessage::PresenceUpdate {
                    replica_id: "a".into(),
                    presence: Value::map([("cursor", Value::int(4))]),
                    internal: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(out[0].to, Recipient::Replicas(vec!["b".into()]));
        assert!(matches!(&out[0].message, ServerMessage::PresenceChanged { replica_id, .. } if replica_id == "a"));

        let out = server.disconnect("a").await.unwrap();
        assert_eq!(
            out[0].message,
            ServerMessage::PresenceOffline {
                replica_id: "a".into(),
                user_id: "user-a".into(),
            }
        );
        assert!(server.disconnect("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_stamps_with_oldest_live_schema() {
        let mut server = server();
        let now = Utc::now();
        server.handle(sync("old", ReplicaType::Realtime, None), now).await.unwrap();
        let out = server
            .handle(
                ClientMessage::Sync {
                    replica_id: "new".into(),
                    user_id: "user-new".into(),
                    replica_type: ReplicaType::Realtime,
                    schema_version: 2,
                    timestamp: TimeAuthority::zero(2),
                    since: None,
                    resync_all: false,
                },
                now,
            )
            .await
            .unwrap();
        match sync_resp(out) {
            ServerMessage::SyncResp { timestamp, .. } => assert_eq!(timestamp.version(), 1),
            other => panic!("unexpected {:?}", other),
        }

        // once the old replica has gone truant only the new schema is live
        let later = now + chrono::Duration::days(15);
        server.disconnect("old").await.unwrap();
        let heartbeat = ClientMessage::Heartbeat {
            replica_id: "new".into(),
            timestamp: TimeAuthority::zero(2),
        };
        match &server.handle(heartbeat, later).await.unwrap()[0].message {
            ServerMessage::HeartbeatResponse { timestamp } => assert_eq!(timestamp.version(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! Client side of the reconciler
//!
//! `ClientSync` owns a `ReplicaStore` and runs the per-connection state
//! machine: handshake, upload, steady-state push and relay, heartbeats and
//! truancy resets. It does not touch the network; the caller feeds it server
//! messages and a clock and sends whatever it returns.

use std::collections::BTreeMap;

use tokio::time::{Duration, Instant};

use super::message::{ClientMessage, ServerMessage};
use super::presence::UserInfo;
use super::replica::ReplicaType;
use super::SyncError;
use crate::clock::Timestamp;
use crate::config::SyncConfig;
use crate::convergent::{compress_operations, Operation, Value};
use crate::store::ReplicaStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Sync sent, waiting for the response
    Handshaking,
    /// Applying the sync response and uploading local changes
    Syncing,
    Steady,
    /// The server discarded our history; local state is being replaced
    TruantReset,
}

pub struct ClientSync {
    replica_id: String,
    user_id: String,
    replica_type: ReplicaType,
    config: SyncConfig,
    store: ReplicaStore,
    state: ConnectionState,
    /// Server timestamp of the last completed handshake
    last_synced: Option<Timestamp>,
    /// Highest server timestamp acknowledged
    last_acked: Option<Timestamp>,
    /// Sent but not yet confirmed by a heartbeat response
    in_flight: Vec<Operation>,
    next_heartbeat: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    reconnect_attempts: u32,
    peers: BTreeMap<String, UserInfo>,
}

impl ClientSync {
    pub fn new(
        replica_id: impl Into<String>,
        user_id: impl Into<String>,
        replica_type: ReplicaType,
        store: ReplicaStore,
        config: SyncConfig,
    ) -> Self {
        Self {
            replica_id: replica_id.into(),
            user_id: user_id.into(),
            replica_type,
            config,
            store,
            state: ConnectionState::Disconnected,
            last_synced: None,
            last_acked: None,
            in_flight: Vec::new(),
            next_heartbeat: None,
            heartbeat_deadline: None,
            reconnect_attempts: 0,
            peers: BTreeMap::new(),
        }
    }

    /// Resume from a previously stored sync point.
    pub fn with_last_synced(mut self, last_synced: Option<Timestamp>) -> Self {
        if let Some(ts) = &last_synced {
            self.store.clock().update(ts);
        }
        self.last_synced = last_synced;
        self
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ReplicaStore {
        &mut self.store
    }

    pub fn last_synced(&self) -> Option<&Timestamp> {
        self.last_synced.as_ref()
    }

    pub fn peers(&self) -> impl Iterator<Item = &UserInfo> {
        self.peers.values()
    }

    pub fn in_flight(&self) -> &[Operation] {
        &self.in_flight
    }

    /// Delay before the next reconnect attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.config.reconnect_delay(self.reconnect_attempts)
    }

    /// Start a handshake.
    pub fn connect(&mut self, resync_all: bool) -> ClientMessage {
        self.state = ConnectionState::Handshaking;
        ClientMessage::Sync {
            replica_id: self.replica_id.clone(),
            user_id: self.user_id.clone(),
            replica_type: self.replica_type,
            schema_version: self.store.schema_version(),
            timestamp: self.store.now(),
            since: if resync_all { None } else { self.last_synced.clone() },
            resync_all,
        }
    }

    /// The connection dropped or a heartbeat went unanswered.
    pub fn disconnected(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        log::info!(
            "Replica {} disconnected with {} unconfirmed operations",
            self.replica_id,
            self.in_flight.len()
        );
        self.state = ConnectionState::Disconnected;
        self.next_heartbeat = None;
        self.heartbeat_deadline = None;
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.peers.clear();
    }

    /// Handle one server message; returns the replies to send.
    pub fn handle(&mut self, message: ServerMessage, now: Instant) -> Result<Vec<ClientMessage>, SyncError> {
        match message {
            ServerMessage::SyncResp {
                timestamp,
                operations,
                baselines,
                provide_changes_since,
                peer_presence,
                reset_to_server,
                ..
            } => {
                if self.state != ConnectionState::Handshaking {
                    return Err(SyncError::Protocol("unexpected sync response".into()));
                }
                self.store.clock().update(&timestamp);
                let mut out = Vec::new();
                if reset_to_server {
                    self.state = ConnectionState::TruantReset;
                    self.in_flight.clear();
                    self.store.reset_to_server(baselines, operations);
                } else {
                    self.state = ConnectionState::Syncing;
                    self.store.apply_baselines(baselines);
                    self.store.apply_remote(operations);
                    if let Some(upload) = self.upload(provide_changes_since.as_ref()) {
                        out.push(upload);
                    }
                }
                self.peers = peer_presence
                    .into_iter()
                    .map(|info| (info.replica_id.clone(), info))
                    .collect();
                self.last_synced = Some(timestamp.clone());
                out.extend(self.ack(timestamp));
                self.state = ConnectionState::Steady;
                self.reconnect_attempts = 0;
                self.next_heartbeat = Some(now + self.config.heartbeat_interval());
                Ok(out)
            }
            ServerMessage::OpRe {
                timestamp,
                operations,
                ..
            } => {
                self.store.clock().update(&timestamp);
                self.store.apply_remote(operations);
                // Queued local writes predate the relay, so they must reach
                // the server before an ack that would let it fold past them.
                let mut out: Vec<ClientMessage> = self.flush().into_iter().collect();
                out.extend(self.ack(timestamp));
                Ok(out)
            }
            ServerMessage::Rebases { rebases } => {
                for notice in rebases {
                    self.store.rebase(&notice.oid, &notice.up_to);
                }
                Ok(Vec::new())
            }
            ServerMessage::HeartbeatResponse { timestamp } => {
                self.store.clock().update(&timestamp);
                self.in_flight.clear();
                self.heartbeat_deadline = None;
                Ok(Vec::new())
            }
            ServerMessage::PresenceChanged { replica_id, user_info } => {
                self.peers.insert(replica_id, user_info);
                Ok(Vec::new())
            }
            ServerMessage::PresenceOffline { replica_id, .. } => {
                self.peers.remove(&replica_id);
                Ok(Vec::new())
            }
            ServerMessage::Error { message } => {
                log::warn!("Server rejected a message from {}: {}", self.replica_id, message);
                Ok(Vec::new())
            }
        }
    }

    /// Advance timers: push the batched local writes once the batching window
    /// has passed, send heartbeats, and give up on a connection whose
    /// heartbeat went unanswered.
    pub fn poll(&mut self, now: Instant) -> Vec<ClientMessage> {
        if self.state != ConnectionState::Steady {
            return Vec::new();
        }
        if self.heartbeat_deadline.is_some_and(|deadline| now >= deadline) {
            log::warn!("Heartbeat timed out for replica {}", self.replica_id);
            self.disconnected();
            return Vec::new();
        }

        let mut out = Vec::new();
        if self.store.outgoing_due(now) {
            out.extend(self.flush());
        }
        if self.next_heartbeat.is_some_and(|at| now >= at) {
            out.push(ClientMessage::Heartbeat {
                replica_id: self.replica_id.clone(),
                timestamp: self.store.now(),
            });
            self.next_heartbeat = Some(now + self.config.heartbeat_interval());
            self.heartbeat_deadline = Some(now + self.config.heartbeat_timeout());
        }
        out
    }

    /// Push whatever local writes are queued, regardless of the batching
    /// window.
    pub fn flush(&mut self) -> Option<ClientMessage> {
        if self.state != ConnectionState::Steady || !self.replica_type.can_write() {
            return None;
        }
        let operations = self.store.take_outgoing();
        if operations.is_empty() {
            return None;
        }
        self.in_flight.extend(operations.iter().cloned());
        Some(self.op_message(operations))
    }

    pub fn set_presence(&mut self, presence: Value, internal: Option<Value>) -> Option<ClientMessage> {
        if self.state != ConnectionState::Steady {
            return None;
        }
        Some(ClientMessage::PresenceUpdate {
            replica_id: self.replica_id.clone(),
            presence,
            internal,
        })
    }

    /// Local operations the server has not confirmed: anything still in flight
    /// from a dropped connection plus the current batch, compressed, and
    /// limited to what the server asked for.
    fn upload(&mut self, since: Option<&Timestamp>) -> Option<ClientMessage> {
        if !self.replica_type.can_write() {
            self.store.take_outgoing();
            return None;
        }
        let mut pending = std::mem::take(&mut self.in_flight);
        pending.extend(self.store.take_outgoing());
        let operations: Vec<Operation> = compress_operations(pending)
            .into_iter()
            .filter(|op| since.map_or(true, |s| op.timestamp > *s))
            .collect();
        if operations.is_empty() {
            return None;
        }
        log::debug!("Replica {} uploading {} operations", self.replica_id, operations.len());
        self.in_flight = operations.clone();
        Some(self.op_message(operations))
    }

    fn op_message(&self, operations: Vec<Operation>) -> ClientMessage {
        let oldest_history_timestamp = operations
            .iter()
            .map(|op| &op.timestamp)
            .min()
            .cloned()
            .unwrap_or_else(|| self.store.now());
        ClientMessage::Op {
            replica_id: self.replica_id.clone(),
            operations,
            oldest_history_timestamp,
        }
    }

    fn ack(&mut self, timestamp: Timestamp) -> Option<ClientMessage> {
        if self.last_acked.as_ref().is_some_and(|acked| acked.tick() >= timestamp.tick()) {
            return None;
        }
        self.last_acked = Some(timestamp.clone());
        Some(ClientMessage::Ack {
            replica_id: self.replica_id.clone(),
            timestamp,
            nonce: None,
        })
    }
}

//! Sync protocol message types
//!
//! Messages are JSON objects tagged by `type`; `transport::WireFormat` can
//! also carry them as CBOR.

use serde::{Deserialize, Serialize};

use super::presence::UserInfo;
use super::replica::ReplicaType;
use crate::clock::{SchemaVersion, Timestamp};
use crate::convergent::{DocumentBaseline, Operation, Value};
use crate::oid::Oid;

/// Messages a client replica sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Heartbeat { replica_id: String, timestamp: Timestamp },

    /// Handshake. `since` is the last server timestamp this replica synced.
    #[serde(rename_all = "camelCase")]
    Sync {
        replica_id: String,
        user_id: String,
        replica_type: ReplicaType,
        schema_version: SchemaVersion,
        timestamp: Timestamp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<Timestamp>,
        #[serde(default)]
        resync_all: bool,
    },

    #[serde(rename_all = "camelCase")]
    Op {
        replica_id: String,
        operations: Vec<Operation>,
        /// Timestamp of the oldest operation in this upload
        oldest_history_timestamp: Timestamp,
    },

    /// "I have everything up to `timestamp`."
    #[serde(rename_all = "camelCase")]
    Ack {
        replica_id: String,
        timestamp: Timestamp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        replica_id: String,
        presence: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        internal: Option<Value>,
    },
}

/// Tells a replica it may fold one entity's operations up to `up_to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RebaseNotice {
    pub oid: Oid,
    pub up_to: Timestamp,
}

/// Messages the server sends to client replicas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    HeartbeatResponse { timestamp: Timestamp },

    /// Reply to a handshake.
    #[serde(rename_all = "camelCase")]
    SyncResp {
        timestamp: Timestamp,
        operations: Vec<Operation>,
        baselines: Vec<DocumentBaseline>,
        /// Upload local operations after this timestamp (all of them when
        /// absent).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provide_changes_since: Option<Timestamp>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        global_ack_timestamp: Option<Timestamp>,
        #[serde(default)]
        peer_presence: Vec<UserInfo>,
        /// Discard local state and adopt `baselines` and `operations`.
        #[serde(default)]
        reset_to_server: bool,
    },

    /// Operations relayed from another replica.
    #[serde(rename_all = "camelCase")]
    OpRe {
        timestamp: Timestamp,
        operations: Vec<Operation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        global_ack_timestamp: Option<Timestamp>,
    },

    #[serde(rename_all = "camelCase")]
    Rebases { rebases: Vec<RebaseNotice> },

    #[serde(rename_all = "camelCase")]
    PresenceChanged { replica_id: String, user_info: UserInfo },

    #[serde(rename_all = "camelCase")]
    PresenceOffline { replica_id: String, user_id: String },

    /// The server refused a message.
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ClientMessage {
    pub fn replica_id(&self) -> &str {
        match self {
            ClientMessage::Heartbeat { replica_id, .. }
            | ClientMessage::Sync { replica_id, .. }
            | ClientMessage::Op { replica_id, .. }
            | ClientMessage::Ack { replica_id, .. }
            | ClientMessage::PresenceUpdate { replica_id, .. } => replica_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;
    use crate::convergent::OperationData;
    use crate::sync::transport::WireFormat;
    use crate::sync::SyncError;

    #[test]
    fn test_sync_message_wire_shape() {
        let msg = ClientMessage::Sync {
            replica_id: "r1".into(),
            user_id: "u1".into(),
            replica_type: ReplicaType::Realtime,
            schema_version: 3,
            timestamp: TimeAuthority::zero(3),
            since: None,
            resync_all: false,
        };
        let json: serde_json::Value = serde_json::from_slice(&WireFormat::Json.encode(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "sync");
        assert_eq!(json["replicaId"], "r1");
        assert_eq!(json["replicaType"], "realtime");
        assert_eq!(json["schemaVersion"], 3);
        assert!(json.get("since").is_none());
    }

    #[test]
    fn test_server_message_parses_with_defaults() {
        let raw = r#"{"type":"sync-resp","timestamp":"0001:000000000000001:000000:s","operations":[],"baselines":[]}"#;
        match WireFormat::Json.decode::<ServerMessage>(raw.as_bytes()).unwrap() {
            ServerMessage::SyncResp {
                reset_to_server,
                provide_changes_since,
                peer_presence,
                ..
            } => {
                assert!(!reset_to_server);
                assert!(provide_changes_since.is_none());
                assert!(peer_presence.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_op_message_cbor() {
        let clock = TimeAuthority::new("a");
        let op = Operation::new(
            "items/1",
            clock.now(1),
            OperationData::set("content", Value::string("Apples")),
        );
        let msg = ClientMessage::Op {
            replica_id: "r1".into(),
            oldest_history_timestamp: op.timestamp.clone(),
            operations: vec![op],
        };
        let restored: ClientMessage = WireFormat::Cbor.decode(&WireFormat::Cbor.encode(&msg).unwrap()).unwrap();
        assert_eq!(restored, msg);
        assert_eq!(restored.replica_id(), "r1");

        let json: serde_json::Value = serde_json::from_slice(&WireFormat::Json.encode(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "op");
        assert!(json.get("oldestHistoryTimestamp").is_some());
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        assert!(matches!(
            WireFormat::Json.decode::<ClientMessage>(br#"{"type":"nope"}"#),
            Err(SyncError::SerializationError(_))
        ));
    }
}

//! Server-side bookkeeping for each connected replica

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{SchemaVersion, Timestamp};

/// How a replica participates in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicaType {
    /// Pushes and receives operations live
    Realtime,
    /// Pushes operations but does not subscribe to relays
    Push,
    /// Pulls on handshake only
    Pull,
    /// Server-side observers; never hold back compaction
    Passive,
    ReadOnlyRealtime,
    ReadOnlyPull,
}

impl ReplicaType {
    /// Whether the replica may submit operations. Passive replicas do not gate
    /// compaction, so they may not write either.
    pub fn can_write(self) -> bool {
        !matches!(
            self,
            ReplicaType::Passive | ReplicaType::ReadOnlyRealtime | ReplicaType::ReadOnlyPull
        )
    }

    /// Whether relayed operations are pushed to the replica.
    pub fn receives_relays(self) -> bool {
        matches!(self, ReplicaType::Realtime | ReplicaType::ReadOnlyRealtime)
    }

    /// Whether the replica's acknowledgement gates compaction.
    pub fn counts_toward_ack(self) -> bool {
        !matches!(self, ReplicaType::Passive)
    }
}

/// What the server remembers about one replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaInfo {
    pub id: String,
    pub user_id: String,
    pub replica_type: ReplicaType,
    /// Schema version announced at the last handshake
    #[serde(default = "first_schema_version")]
    pub schema_version: SchemaVersion,
    /// Latest server stamp the replica has acknowledged: it holds every
    /// operation that reached the server at or before that stamp
    #[serde(default)]
    pub acked_logical_time: Option<Timestamp>,
    /// Server timestamp of the replica's last completed handshake
    #[serde(default)]
    pub last_synced_logical_time: Option<Timestamp>,
    pub last_seen_wall_clock_time: DateTime<Utc>,
}

fn first_schema_version() -> SchemaVersion {
    1
}

impl ReplicaInfo {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, replica_type: ReplicaType, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            replica_type,
            schema_version: first_schema_version(),
            acked_logical_time: None,
            last_synced_logical_time: None,
            last_seen_wall_clock_time: now,
        }
    }

    /// A replica unseen for longer than `threshold` is truant.
    pub fn is_truant(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        now.signed_duration_since(self.last_seen_wall_clock_time)
            .num_milliseconds()
            > threshold_ms
    }

    /// Raise the acknowledged stamp; acks never move backwards in server
    /// tick order.
    pub fn acknowledge(&mut self, timestamp: &Timestamp) -> bool {
        match &self.acked_logical_time {
            Some(current) if current.tick() >= timestamp.tick() => false,
            _ => {
                self.acked_logical_time = Some(timestamp.clone());
                true
            }
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen_wall_clock_time {
            self.last_seen_wall_clock_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimeAuthority;

    #[test]
    fn test_truancy() {
        let seen = Utc::now();
        let replica = ReplicaInfo::new("r1", "u1", ReplicaType::Realtime, seen);
        let threshold = Duration::from_secs(60);
        assert!(!replica.is_truant(seen + chrono::Duration::seconds(59), threshold));
        assert!(replica.is_truant(seen + chrono::Duration::seconds(61), threshold));
    }

    #[test]
    fn test_acks_are_monotonic() {
        let clock = TimeAuthority::new("s");
        let early = clock.now(1);
        let late = clock.now(1);
        let mut replica = ReplicaInfo::new("r1", "u1", ReplicaType::Realtime, Utc::now());

        assert!(replica.acknowledge(&late));
        assert!(!replica.acknowledge(&early));
        assert_eq!(replica.acked_logical_time, Some(late));

        // a later stamp under an older schema still advances the ack
        let older_schema = clock.now(0);
        assert!(replica.acknowledge(&older_schema));
    }

    #[test]
    fn test_replica_type_capabilities() {
        assert!(!ReplicaType::ReadOnlyPull.can_write());
        assert!(ReplicaType::Push.can_write());
        assert!(ReplicaType::ReadOnlyRealtime.receives_relays());
        assert!(!ReplicaType::Pull.receives_relays());
        assert!(!ReplicaType::Passive.counts_toward_ack());
        assert_eq!(serde_json::to_string(&ReplicaType::ReadOnlyPull).unwrap(), "\"read-only-pull\"");
    }
}

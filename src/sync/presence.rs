//! Ephemeral presence
//!
//! Presence is never persisted and never enters the operation log. The server
//! keeps the latest value per replica while it is connected.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::convergent::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub replica_id: String,
    pub user_id: String,
    pub presence: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<Value>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: HashMap<String, UserInfo>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a replica's presence, replacing its previous value.
    pub fn update(&mut self, info: UserInfo) -> &UserInfo {
        let replica_id = info.replica_id.clone();
        self.entries.insert(replica_id.clone(), info);
        &self.entries[&replica_id]
    }

    pub fn get(&self, replica_id: &str) -> Option<&UserInfo> {
        self.entries.get(replica_id)
    }

    /// Forget a replica; returns what it last reported.
    pub fn remove(&mut self, replica_id: &str) -> Option<UserInfo> {
        self.entries.remove(replica_id)
    }

    /// Presence of every replica except `replica_id`.
    pub fn peers_of(&self, replica_id: &str) -> Vec<UserInfo> {
        let mut peers: Vec<UserInfo> = self
            .entries
            .values()
            .filter(|info| info.replica_id != replica_id)
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));
        peers
    }
}

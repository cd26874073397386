//! Replica reconciliation
//!
//! The server holds the authoritative operation log and baselines; clients
//! hold local replicas (see `crate::store`). They speak the message protocol
//! in `message` over any `SyncConnection`. The server tracks every replica's
//! acknowledgement state and folds operations into baselines once all live
//! replicas have seen them.

pub mod client;
pub mod message;
pub mod presence;
pub mod rebase;
pub mod replica;
pub mod server;
pub mod storage;
pub mod transport;

pub use client::{ClientSync, ConnectionState};
pub use message::{ClientMessage, RebaseNotice, ServerMessage};
pub use presence::{PresenceRegistry, UserInfo};
pub use rebase::{compute_global_ack, RebaseCoordinator};
pub use replica::{ReplicaInfo, ReplicaType};
pub use server::{Outgoing, Recipient, ServerSync};
pub use storage::{MemoryStorage, SyncStorage};
pub use transport::{maintain_connection, run_client, ChannelConnection, SyncConnection, SyncHub, WireFormat};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unknown replica: {0}")]
    UnknownReplica(String),

    #[error("Replica {0} is read-only")]
    ReadOnly(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

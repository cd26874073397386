// Tidepool - Local-first replica synchronization

pub mod clock;
pub mod config;
pub mod convergent;
pub mod migration;
pub mod oid;
pub mod store;
pub mod sync;

pub use clock::{SchemaVersion, TimeAuthority, Timestamp};
pub use config::{ConfigError, SyncConfig};
pub use store::{ReplicaStore, StoreEvent};

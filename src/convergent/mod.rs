//! Convergent document model
//!
//! Operations, their pure `apply`/`invert` functions, and reconstruction of
//! entity views from a baseline snapshot plus an ordered operation log.
//! Everything here is synchronous and free of I/O, so it is shared by client
//! and server replicas alike.

mod apply;
mod arena;
mod batch;
mod invert;
mod operation;
mod reconstruct;
mod undo;
mod value;

pub use apply::apply;
pub use arena::{ChangeCallback, DocumentArena};
pub use batch::{compress_operations, OperationBatcher};
pub use invert::invert;
pub use operation::{Operation, OperationData, RemoveOnly};
pub use reconstruct::{fold_baseline, reconstruct, sort_operations, DocumentBaseline};
pub use undo::{compute_undo_entry, UndoEntry, UndoHistory};
pub use value::Value;

use thiserror::Error;

use crate::oid::OidError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvergentError {
    #[error("Shape mismatch on {oid}: expected {expected}, found {found}")]
    ShapeMismatch {
        oid: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid list index {name:?} on {oid}")]
    InvalidIndex { oid: String, name: String },

    #[error("Missing primary key for new {0} document")]
    MissingPrimaryKey(String),

    #[error("Reference cycle through {0}")]
    ReferenceCycle(String),

    #[error("OID error: {0}")]
    Oid(#[from] OidError),
}

impl ConvergentError {
    pub(crate) fn shape(oid: &str, expected: &'static str, found: &Value) -> Self {
        ConvergentError::ShapeMismatch {
            oid: oid.to_string(),
            expected,
            found: found.kind(),
        }
    }
}

//! Object identifiers
//!
//! Every entity is addressed by a string OID:
//!
//! - root (document): `collection/primaryKey`
//! - nested entity:   `collection/primaryKey:subId`
//!
//! The root of any OID is the text before the first `:`. Sub-ids are random
//! tokens assigned once when the nested entity is created.

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

/// An entity address.
pub type Oid = String;

const SUB_ID_LEN: usize = 12;
const RANGE_UPPER: char = '\u{ffff}';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OidError {
    #[error("Malformed OID: {0}")]
    Malformed(String),

    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Invalid primary key: {0:?}")]
    InvalidPrimaryKey(String),

    #[error("Invalid sub id: {0:?}")]
    InvalidSubId(String),
}

/// The parts of a decomposed OID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OidParts {
    pub collection: String,
    pub id: String,
    pub sub_id: Option<String>,
}

/// Build an OID from its parts.
pub fn create_oid(collection: &str, primary_key: &str, sub_id: Option<&str>) -> Result<Oid, OidError> {
    if collection.is_empty() || collection.contains('/') || collection.contains(':') {
        return Err(OidError::InvalidCollection(collection.to_string()));
    }
    if primary_key.is_empty() || primary_key.contains(':') || primary_key.contains('/') {
        return Err(OidError::InvalidPrimaryKey(primary_key.to_string()));
    }
    match sub_id {
        None => Ok(format!("{}/{}", collection, primary_key)),
        Some(sub) if sub.is_empty() || sub.contains('/') || sub.contains(':') => {
            Err(OidError::InvalidSubId(sub.to_string()))
        }
        Some(sub) => Ok(format!("{}/{}:{}", collection, primary_key, sub)),
    }
}

/// Split an OID into collection, primary key and optional sub-id.
pub fn decompose_oid(oid: &str) -> Result<OidParts, OidError> {
    let (collection, rest) = oid
        .split_once('/')
        .ok_or_else(|| OidError::Malformed(oid.to_string()))?;
    let (id, sub_id) = match rest.split_once(':') {
        Some((id, sub)) => (id, Some(sub)),
        None => (rest, None),
    };
    if collection.is_empty() || id.is_empty() || id.contains('/') {
        return Err(OidError::Malformed(oid.to_string()));
    }
    if let Some(sub) = sub_id {
        if sub.is_empty() || sub.contains('/') || sub.contains(':') {
            return Err(OidError::Malformed(oid.to_string()));
        }
    }
    Ok(OidParts {
        collection: collection.to_string(),
        id: id.to_string(),
        sub_id: sub_id.map(str::to_string),
    })
}

/// The document root of an OID.
pub fn get_oid_root(oid: &str) -> &str {
    match oid.split_once(':') {
        Some((root, _)) => root,
        None => oid,
    }
}

pub fn is_root_oid(oid: &str) -> bool {
    !oid.contains(':')
}

/// `[lower, upper]` bounds covering every nested OID under `oid`'s root, for
/// ordered range scans.
pub fn get_oid_sub_id_range(oid: &str) -> (String, String) {
    let root = get_oid_root(oid);
    (format!("{}:", root), format!("{}:{}", root, RANGE_UPPER))
}

/// Whether `oid` is `root` itself or one of its nested entities
/// (`^root(:[^/]+)?$`).
pub fn matches_root(oid: &str, root: &str) -> bool {
    match oid.strip_prefix(root) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix(':')
            .is_some_and(|sub| !sub.is_empty() && !sub.contains('/')),
        None => false,
    }
}

/// A fresh random sub-id.
pub fn random_sub_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUB_ID_LEN)
        .map(char::from)
        .collect()
}

/// Create a new nested OID under `parent`'s root.
pub fn create_sub_oid(parent: &str) -> Oid {
    format!("{}:{}", get_oid_root(parent), random_sub_id())
}

//! Metadata records and the reserved names they live under.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_storage::{path, StorageError, StorageResult};

/// Suffix of a metadata record
pub const META_SUFFIX: &str = ".~meta";
/// Suffix of a shadow name; the shadow record is `<path>.~shadow.~meta`
pub const SHADOW_SUFFIX: &str = ".~shadow";

/// Small side-car describing one logical object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Entry name inside the version
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Time the version was committed
    pub mod_time: DateTime<Utc>,
    /// Version handle (manifest id)
    pub version: String,
}

impl MetaRecord {
    /// JSON encoding stored in the sidecar
    pub fn encode(&self) -> StorageResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(StorageError::engine)
    }

    /// Parse a stored record
    pub fn decode(raw: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(raw).map_err(StorageError::engine)
    }
}

/// Sidecar path of the record for `path`
pub fn meta_path(path: &str) -> String {
    format!("{path}{META_SUFFIX}")
}

/// Sidecar path of the shadow record for `path`
pub fn shadow_meta_path(path: &str) -> String {
    format!("{path}{SHADOW_SUFFIX}{META_SUFFIX}")
}

/// Logical path a sidecar record belongs to, and whether it is a shadow.
/// `None` for names that are not records.
pub fn logical_path(sidecar_path: &str) -> Option<(&str, bool)> {
    let stem = sidecar_path.strip_suffix(META_SUFFIX)?;
    Some(match stem.strip_suffix(SHADOW_SUFFIX) {
        Some(live) => (live, true),
        None => (stem, false),
    })
}

/// Reject caller paths with a segment that would collide with a reserved
/// name, either as a record or as a directory in the record namespace.
pub fn check_leaf(caller: &str) -> StorageResult<()> {
    for suffix in [META_SUFFIX, SHADOW_SUFFIX] {
        if let Some(segment) = path::segment_ending_with(caller, suffix) {
            return Err(StorageError::invalid_path(
                caller,
                format!("{segment:?} uses a reserved suffix"),
            ));
        }
    }
    Ok(())
}

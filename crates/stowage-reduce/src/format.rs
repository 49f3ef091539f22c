//! Repository format document, blob layout and default maintenance parameters

use crate::compression::CompressionAlgorithm;
use crate::dedupe::ChunkerConfig;
use crate::encryption::EncryptionAlgorithm;
use crate::error::{ReduceError, ReduceResult};
use crate::fingerprint::ChunkHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format version written by this engine
pub const FORMAT_VERSION: u32 = 3;
/// Content hash recorded in the format document
pub const HASH_ALGORITHM: &str = "BLAKE3-256";
/// Password used when the caller supplies an empty one
pub const DEFAULT_PASSWORD: &str = "d@ta$aFed";

/// Plain JSON format document at the repository root
pub const FORMAT_BLOB: &str = "format";
/// Sealed maintenance parameters
pub const MAINTENANCE_BLOB: &str = "maintenance";
/// Directory of sealed content index deltas
pub const INDEX_DIR: &str = "indexes";
/// Directory of sealed manifests
pub const MANIFEST_DIR: &str = "manifests";
/// Directory of sharded chunk envelopes
pub const CHUNK_DIR: &str = "chunks";

/// Plaintext sealed into `key_check`; opening it proves the password.
pub(crate) const KEY_CHECK_PLAINTEXT: &str = "stowage-key-check";

/// Blob path of a chunk envelope
pub fn chunk_path(hash: &ChunkHash) -> String {
    format!("{}/{}/{}", CHUNK_DIR, hash.shard(), hash.to_hex())
}

/// Blob path of a manifest
pub fn manifest_path(id: &str) -> String {
    format!("{}/{}", MANIFEST_DIR, id)
}

/// Blob path of an index delta
pub fn index_path(id: &str) -> String {
    format!("{}/{}", INDEX_DIR, id)
}

/// The repository's fixed algorithm choices, written once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryFormat {
    /// Format version
    pub version: u32,
    /// Random repository id; salts the master key
    pub unique_id: String,
    /// Content hash name
    pub hash: String,
    /// Sealing cipher
    pub encryption: EncryptionAlgorithm,
    /// Chunk compression
    pub compression: CompressionAlgorithm,
    /// Chunk size bounds
    pub splitter: ChunkerConfig,
    /// Whether index deltas may be compacted by quick maintenance
    pub epoch_index: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Sealed [`KEY_CHECK_PLAINTEXT`]
    #[serde(default)]
    pub key_check: Vec<u8>,
}

impl RepositoryFormat {
    /// Fresh format with the fixed defaults and a random id. `key_check` is
    /// filled in by the repository once the key is derived.
    pub fn new() -> Self {
        let id: [u8; 16] = rand::random();
        Self {
            version: FORMAT_VERSION,
            unique_id: id.iter().map(|b| format!("{:02x}", b)).collect(),
            hash: HASH_ALGORITHM.to_string(),
            encryption: EncryptionAlgorithm::AesGcm256,
            compression: CompressionAlgorithm::Zstd { level: 3 },
            splitter: ChunkerConfig::default(),
            epoch_index: true,
            created_at: Utc::now(),
            key_check: Vec::new(),
        }
    }

    /// Reject documents this engine cannot read.
    pub fn validate(&self) -> ReduceResult<()> {
        if self.version == 0 || self.version > FORMAT_VERSION {
            return Err(ReduceError::UnsupportedFormat(self.version));
        }
        if self.hash != HASH_ALGORITHM {
            return Err(ReduceError::Serialization(format!(
                "unsupported hash algorithm {}",
                self.hash
            )));
        }
        Ok(())
    }
}

impl Default for RepositoryFormat {
    fn default() -> Self {
        Self::new()
    }
}

/// Schedule for one maintenance cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleParams {
    /// Whether the cycle runs at all
    pub enabled: bool,
    /// Minimum time between runs
    pub interval_secs: u64,
}

/// Who runs maintenance and when it last ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceParams {
    /// `user@host` allowed to run maintenance without forcing
    pub owner: String,
    /// Quick cycle: index compaction
    pub quick_cycle: CycleParams,
    /// Full cycle: chunk sweep
    pub full_cycle: CycleParams,
    /// Last successful quick run
    #[serde(default)]
    pub last_quick: Option<DateTime<Utc>>,
    /// Last successful full run
    #[serde(default)]
    pub last_full: Option<DateTime<Utc>>,
}

impl MaintenanceParams {
    /// Conservative defaults owned by the current user. The quick cycle is
    /// left to epoch compaction when the format supports it.
    pub fn defaults(epoch_index: bool) -> Self {
        Self {
            owner: current_owner(),
            quick_cycle: CycleParams {
                enabled: !epoch_index,
                interval_secs: 3600,
            },
            full_cycle: CycleParams {
                enabled: true,
                interval_secs: 24 * 3600,
            },
            last_quick: None,
            last_full: None,
        }
    }
}

/// `user@host` of this process, from the environment.
pub fn current_owner() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}@{}", user, host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;

    #[test]
    fn new_format_uses_fixed_choices() {
        let f = RepositoryFormat::new();
        assert_eq!(f.version, 3);
        assert_eq!(f.hash, "BLAKE3-256");
        assert_eq!(f.encryption, EncryptionAlgorithm::AesGcm256);
        assert_eq!(f.compression, CompressionAlgorithm::Zstd { level: 3 });
        assert_eq!(f.splitter.min_size, 128 * 1024);
        assert_eq!(f.splitter.avg_size, 512 * 1024);
        assert_eq!(f.splitter.max_size, 2 * 1024 * 1024);
        assert!(f.epoch_index);
        assert_eq!(f.unique_id.len(), 32);
        assert_ne!(f.unique_id, RepositoryFormat::new().unique_id);
        f.validate().unwrap();
    }

    #[test]
    fn newer_versions_are_rejected() {
        let mut f = RepositoryFormat::new();
        f.version = FORMAT_VERSION + 1;
        assert!(matches!(f.validate(), Err(ReduceError::UnsupportedFormat(4))));
    }

    #[test]
    fn format_json_round_trip() {
        let f = RepositoryFormat::new();
        let json = serde_json::to_string(&f).unwrap();
        let back: RepositoryFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(back.unique_id, f.unique_id);
        assert_eq!(back.splitter, f.splitter);
    }

    #[test]
    fn maintenance_defaults_follow_epoch_support() {
        assert!(!MaintenanceParams::defaults(true).quick_cycle.enabled);
        assert!(MaintenanceParams::defaults(false).quick_cycle.enabled);
        assert!(MaintenanceParams::defaults(true).owner.contains('@'));
    }

    #[test]
    fn chunk_paths_are_sharded() {
        let h = blake3_hash(b"x");
        let p = chunk_path(&h);
        assert_eq!(p, format!("chunks/{}/{}", &h.to_hex()[..2], h.to_hex()));
        assert_eq!(manifest_path("m"), "manifests/m");
        assert_eq!(index_path("i"), "indexes/i");
    }
}

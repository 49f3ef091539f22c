//! Manifests: the versioned record of one snapshotted stream.

use crate::fingerprint::ChunkHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a snapshot came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// User that wrote it
    pub user: String,
    /// Host it was written from
    pub host: String,
    /// Logical name of the snapshotted stream
    pub path: String,
}

impl SourceInfo {
    /// Source for `path` written by this process
    pub fn local(path: impl Into<String>) -> Self {
        let owner = crate::format::current_owner();
        let (user, host) = owner.split_once('@').unwrap_or((owner.as_str(), ""));
        Self {
            user: user.to_string(),
            host: host.to_string(),
            path: path.into(),
        }
    }
}

/// One chunk of an entry, in stream order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Content hash
    pub hash: ChunkHash,
    /// Offset of the chunk within the entry
    pub offset: u64,
    /// Plaintext length
    pub length: u64,
}

impl ChunkRef {
    /// Offset one past the last byte
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The single named entry a manifest records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Entry name
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// Chunks in order; their lengths sum to `size`
    pub chunks: Vec<ChunkRef>,
}

impl ManifestEntry {
    /// Index of the chunk holding byte `offset` and the position of that
    /// byte within it. `None` when `offset` is at or past the end.
    pub fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        if offset >= self.size {
            return None;
        }
        let idx = self.chunks.partition_point(|c| c.end() <= offset);
        self.chunks.get(idx).map(|c| (idx, offset - c.offset))
    }
}

/// Immutable snapshot of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Version handle
    pub id: String,
    /// Origin
    pub source: SourceInfo,
    /// Recorded content
    pub entry: ManifestEntry,
    /// When the snapshot started
    pub start_time: DateTime<Utc>,
    /// When the last byte was stored
    pub end_time: DateTime<Utc>,
}

impl Manifest {
    /// Fresh random version handle
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Hashes of every chunk the manifest keeps alive
    pub fn chunk_hashes(&self) -> impl Iterator<Item = ChunkHash> + '_ {
        self.entry.chunks.iter().map(|c| c.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;

    fn entry(lengths: &[u64]) -> ManifestEntry {
        let mut offset = 0;
        let chunks = lengths
            .iter()
            .enumerate()
            .map(|(i, &length)| {
                let c = ChunkRef {
                    hash: blake3_hash(&[i as u8]),
                    offset,
                    length,
                };
                offset += length;
                c
            })
            .collect();
        ManifestEntry {
            name: "f".to_string(),
            size: offset,
            chunks,
        }
    }

    #[test]
    fn locate_finds_chunk_and_skip() {
        let e = entry(&[10, 20, 5]);
        assert_eq!(e.locate(0), Some((0, 0)));
        assert_eq!(e.locate(9), Some((0, 9)));
        assert_eq!(e.locate(10), Some((1, 0)));
        assert_eq!(e.locate(29), Some((1, 19)));
        assert_eq!(e.locate(30), Some((2, 0)));
        assert_eq!(e.locate(34), Some((2, 4)));
        assert_eq!(e.locate(35), None);
    }

    #[test]
    fn empty_entry_locates_nothing() {
        assert_eq!(entry(&[]).locate(0), None);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Manifest::new_id(), Manifest::new_id());
        assert_eq!(Manifest::new_id().len(), 32);
    }

    #[test]
    fn source_splits_owner() {
        let s = SourceInfo::local("a/b");
        assert_eq!(s.path, "a/b");
        assert!(!s.user.is_empty());
    }
}

#![warn(missing_docs)]

//! Stowage snapshot engine: versioned, deduplicated, encrypted blob repository
//!
//! Write path: Stream → Chunk (FastCDC) → Fingerprint (BLAKE3) → Dedupe → Compress → Encrypt → Store
//! Read path:  Manifest → Chunks → Decrypt → Decompress → Verify → Stream
//!
//! A [`Repository`] lives inside any `stowage_storage::Storage` stack. Content
//! enters through a [`WriteSession`], which snapshots one named stream per
//! manifest; [`Repository::open_file`] materializes a manifest back as a
//! ranged byte stream; [`maintenance::run`] compacts and sweeps.

pub mod blob;
pub mod cache;
pub mod compression;
pub mod dedupe;
pub mod encryption;
pub mod error;
pub mod fingerprint;
pub mod format;
pub mod maintenance;
pub mod manifest;
pub mod repository;
pub mod session;

pub use blob::BlobStore;
pub use cache::{CacheConfig, ChunkCache, DEFAULT_MAX_CACHE_BYTES};
pub use compression::CompressionAlgorithm;
pub use dedupe::{Chunk, ChunkInfo, Chunker, ChunkerConfig, ContentIndex, IndexDelta, StreamChunker};
pub use encryption::{EncryptedChunk, EncryptionAlgorithm, EncryptionKey};
pub use error::{ReduceError, ReduceResult};
pub use fingerprint::ChunkHash;
pub use format::{MaintenanceParams, RepositoryFormat, DEFAULT_PASSWORD, FORMAT_VERSION};
pub use maintenance::{MaintenanceMode, MaintenanceStats, SafetyLevel};
pub use manifest::{ChunkRef, Manifest, ManifestEntry, SourceInfo};
pub use repository::{Repository, RepositoryOptions};
pub use session::{SnapshotSummary, WriteSession};

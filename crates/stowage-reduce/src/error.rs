//! Error types for the stowage-reduce snapshot engine

use stowage_storage::StorageError;

/// All errors that can occur in the snapshot engine
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Authentication tag mismatch on decryption
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// The repository password does not open the repository key
    #[error("Invalid repository password")]
    InvalidPassword,
    /// A repository was about to be created somewhere that already holds data
    #[error("Cannot initialize repository: location is not empty ({0})")]
    NotEmpty(String),
    /// The repository format version is not understood
    #[error("Unsupported repository format version {0}")]
    UnsupportedFormat(u32),
    /// No manifest with this id
    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),
    /// The manifest does not contain the requested entry
    #[error("Entry {name:?} not found in manifest {manifest}")]
    EntryNotFound {
        /// Manifest that was searched.
        manifest: String,
        /// Entry name that was requested.
        name: String,
    },
    /// A chunk referenced by a manifest is missing from the repository
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),
    /// A chunk decrypted to content that does not match its hash
    #[error("Integrity check failed for chunk {0}")]
    IntegrityMismatch(String),
    /// Maintenance is owned by someone else and was not forced
    #[error("Maintenance is owned by {owner}, not {current}")]
    NotOwner {
        /// Recorded maintenance owner.
        owner: String,
        /// Identity of this process.
        current: String,
    },
    /// Encoding or decoding a repository document failed
    #[error("Serialization failed: {0}")]
    Serialization(String),
    /// The blob store underneath the repository failed
    #[error("Blob storage error: {0}")]
    Storage(#[from] StorageError),
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ReduceError {
    fn from(err: serde_json::Error) -> Self {
        ReduceError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ReduceError {
    fn from(err: bincode::Error) -> Self {
        ReduceError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type ReduceResult<T> = Result<T, ReduceError>;

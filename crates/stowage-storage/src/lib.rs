#![warn(missing_docs)]

//! Stowage storage layer: the storage contract and its composable layers
//!
//! A stack is an `Arc<dyn Storage>` built from a backend adapter
//! ([`BackendStorage`] over a [`LocalBackend`] or [`MemoryBackend`]) and any
//! number of wrappers: [`SanitizedStorage`] confines paths beneath a base path
//! and [`EncryptedStorage`] encrypts object content with a [`StreamEncryptor`].
//! Every layer preserves the sentinel errors in [`StorageError`].

pub mod backend;
pub mod config;
pub mod encrypted;
pub mod encryption;
pub mod error;
pub mod local;
pub mod memory;
pub mod obscure;
pub mod path;
pub mod pipe;
pub mod sanitized;
pub mod skip;
pub mod storage;
pub mod types;

pub use backend::{BackendError, BackendResult, BackendStorage, ByteRange, ObjectBackend, ObjectInfo};
pub use config::{open_backend, BackendConfig};
pub use encrypted::{EncryptedStorage, ENCRYPTED_SUFFIX};
pub use encryption::{
    create_encryptor, supported_algorithms, AesCfbEncryptor, AesKeySize, EncryptionError,
    StreamEncryptor, DEFAULT_ALGORITHM,
};
pub use error::{ErrorKind, StorageError, StorageResult, StorageResultExt};
pub use local::LocalBackend;
pub use memory::{MemoryBackend, MemoryBackendStats};
pub use sanitized::SanitizedStorage;
pub use storage::{describe_stack, find_layer, stat_by_listing, ListCallback, Storage};
pub use types::{ByteStream, DirEntry, ListOptions, Sink, Source, StatResult};

//! Error types shared by every storage layer.
//!
//! Four variants are sentinels that callers branch on: [`StorageError::ObjectNotFound`],
//! [`StorageError::DirNotFound`], [`StorageError::IsDirectory`] and
//! [`StorageError::InvalidPath`]. Layers add context with [`StorageError::context`],
//! which wraps the error without changing what [`StorageError::kind`] reports.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// The classification of a [`StorageError`], looked through any context wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The object does not exist.
    ObjectNotFound,
    /// The directory does not exist.
    DirNotFound,
    /// The path names a directory where an object was expected.
    IsDirectory,
    /// The path is malformed or escapes its confinement.
    InvalidPath,
    /// Encryption or decryption failed.
    Transform,
    /// The blob backend failed.
    Backend,
    /// The snapshot engine failed.
    Engine,
    /// A layer of the wrong type was found where a specific one was required.
    TypeMismatch,
    /// Invalid configuration.
    Config,
    /// Plain I/O failure.
    Io,
}

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("object not found: {path}")]
    ObjectNotFound {
        /// Path of the missing object.
        path: String,
    },

    /// The requested directory does not exist.
    #[error("directory not found: {path}")]
    DirNotFound {
        /// Path of the missing directory.
        path: String,
    },

    /// The path denotes a directory.
    #[error("path is a directory: {path}")]
    IsDirectory {
        /// The offending path.
        path: String,
    },

    /// The path is malformed or escapes the base path.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path as supplied by the caller.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Encryption or decryption of a stream failed.
    #[error("transform failed: {0}")]
    Transform(String),

    /// The blob backend reported a failure that has no sentinel meaning.
    #[error("backend error: {0}")]
    Backend(String),

    /// The snapshot engine failed.
    #[error("engine error: {source}")]
    Engine {
        /// Underlying engine error.
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A required layer type was not found in a storage stack.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// What the caller required.
        expected: &'static str,
        /// What was found instead.
        found: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another error with added context.
    #[error("{context}: {source}")]
    Context {
        /// Description of the operation that failed.
        context: String,
        /// The wrapped error.
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Creates an [`StorageError::ObjectNotFound`].
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::ObjectNotFound { path: path.into() }
    }

    /// Creates a [`StorageError::DirNotFound`].
    pub fn dir_not_found(path: impl Into<String>) -> Self {
        Self::DirNotFound { path: path.into() }
    }

    /// Creates a [`StorageError::IsDirectory`].
    pub fn is_directory(path: impl Into<String>) -> Self {
        Self::IsDirectory { path: path.into() }
    }

    /// Creates a [`StorageError::InvalidPath`].
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an engine error.
    pub fn engine(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Engine {
            source: Box::new(source),
        }
    }

    /// Adds context without changing the error's kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The kind of this error, looked through any context wrappers.
    ///
    /// I/O errors that carry a [`StorageError`] (as produced by [`StorageError::into_io`]
    /// when an error has to travel through a byte stream) report the carried kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            Self::DirNotFound { .. } => ErrorKind::DirNotFound,
            Self::IsDirectory { .. } => ErrorKind::IsDirectory,
            Self::InvalidPath { .. } => ErrorKind::InvalidPath,
            Self::Transform(_) => ErrorKind::Transform,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Engine { .. } => ErrorKind::Engine,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(err) => match err.get_ref().and_then(|inner| inner.downcast_ref::<StorageError>()) {
                Some(carried) => carried.kind(),
                None => ErrorKind::Io,
            },
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// True if the error is an [`ErrorKind::ObjectNotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::ObjectNotFound
    }

    /// True if the error is an [`ErrorKind::DirNotFound`].
    pub fn is_dir_not_found(&self) -> bool {
        self.kind() == ErrorKind::DirNotFound
    }

    /// Converts into an I/O error that still carries this error, so the kind
    /// survives a trip through an `AsyncRead`/`AsyncWrite` boundary.
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(err) => err,
            other => {
                let kind = match other.kind() {
                    ErrorKind::ObjectNotFound | ErrorKind::DirNotFound => io::ErrorKind::NotFound,
                    ErrorKind::InvalidPath => io::ErrorKind::InvalidInput,
                    _ => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }

    /// Recovers a carried [`StorageError`] from an I/O error, if there is one.
    pub fn from_io(err: io::Error) -> Self {
        let carries_storage_error = err
            .get_ref()
            .is_some_and(|inner| inner.is::<StorageError>());
        if carries_storage_error {
            if let Some(inner) = err.into_inner() {
                if let Ok(storage) = inner.downcast::<StorageError>() {
                    return *storage;
                }
            }
            return Self::Backend("unrecoverable wrapped storage error".to_string());
        }
        Self::Io(err)
    }
}

/// Adds context to storage results.
pub trait StorageResultExt<T> {
    /// Wraps the error, if any, with a fixed context string.
    fn context(self, context: impl Into<String>) -> StorageResult<T>;

    /// Wraps the error, if any, with a lazily built context string.
    fn with_context<F, C>(self, f: F) -> StorageResult<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> StorageResultExt<T> for StorageResult<T> {
    fn context(self, context: impl Into<String>) -> StorageResult<T> {
        self.map_err(|err| err.context(context))
    }

    fn with_context<F, C>(self, f: F) -> StorageResult<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.context(f()))
    }
}

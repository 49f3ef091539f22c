//! Generic backend adapter.
//!
//! [`ObjectBackend`] is the narrow blob interface a concrete remote implements
//! (local directory, in-memory map, object stores). [`BackendStorage`] lifts
//! any of them to the full [`Storage`] contract: path normalization, sentinel
//! mapping, recursive walks and the length-aware versus streaming upload choice.

use std::any::Any;
use std::collections::VecDeque;
use std::io;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::path;
use crate::storage::{ListCallback, Storage};
use crate::types::{ByteStream, DirEntry, ListOptions, Sink, Source, StatResult};

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors reported by an [`ObjectBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// No object at the path.
    #[error("object not found")]
    NotFound,

    /// No directory at the path.
    #[error("directory not found")]
    DirNotFound,

    /// The path is a directory.
    #[error("is a directory")]
    IsDir,

    /// The directory still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// An upload delivered a different number of bytes than announced.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Announced length.
        expected: u64,
        /// Bytes actually read from the source.
        actual: u64,
    },

    /// A parent segment of the path is an object, not a directory.
    #[error("parent {0:?} is not a directory")]
    NotADirectory(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    /// Maps to a [`StorageError`], turning backend conditions into sentinels.
    pub fn into_storage(self, path: &str) -> StorageError {
        match self {
            Self::NotFound => StorageError::not_found(path),
            Self::DirNotFound => StorageError::dir_not_found(path),
            Self::IsDir => StorageError::is_directory(path),
            Self::Io(err) => StorageError::from_io(err).context(format!("backend {path}")),
            other => StorageError::Backend(format!("{path}: {other}")),
        }
    }
}

/// Metadata about one object or directory held by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Normalized path of the object.
    pub path: String,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub mod_time: DateTime<Utc>,
}

impl ObjectInfo {
    /// Converts to a [`DirEntry`].
    pub fn to_entry(&self) -> DirEntry {
        let name = path::base_name(&self.path);
        if self.is_dir {
            DirEntry::dir(name, &self.path, self.mod_time)
        } else {
            DirEntry::file(name, &self.path, self.size, self.mod_time)
        }
    }
}

/// A byte range within an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub offset: u64,
    /// Number of bytes; `None` reads to the end.
    pub length: Option<u64>,
}

impl ByteRange {
    /// The whole object.
    pub fn full() -> Self {
        Self::default()
    }
}

/// Blob interface implemented by concrete backends.
///
/// Paths are normalized before they reach a backend: no leading or trailing
/// separator, and `""` is the root.
#[async_trait]
pub trait ObjectBackend: Send + Sync + 'static {
    /// Short backend name, e.g. `"local"`.
    fn name(&self) -> &'static str;

    /// Whether uploads of unknown length can be streamed without spooling.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Metadata of a single object. Directories yield [`BackendError::IsDir`].
    async fn stat_object(&self, path: &str) -> BackendResult<ObjectInfo>;

    /// Uploads exactly `size` bytes.
    async fn put_sized(&self, path: &str, reader: ByteStream, size: u64) -> BackendResult<()>;

    /// Uploads a stream of unknown length.
    async fn put_stream(&self, path: &str, reader: ByteStream) -> BackendResult<()>;

    /// Reads a range of an object.
    async fn get(&self, path: &str, range: ByteRange) -> BackendResult<ByteStream>;

    /// Deletes one object.
    async fn delete(&self, path: &str) -> BackendResult<()>;

    /// Deletes a directory and everything under it.
    async fn purge(&self, dir: &str) -> BackendResult<()>;

    /// Creates a directory. Backends without directories succeed without effect.
    async fn mkdir(&self, dir: &str) -> BackendResult<()>;

    /// Removes an empty directory.
    async fn rmdir(&self, dir: &str) -> BackendResult<()>;

    /// Immediate children of a directory.
    async fn list_dir(&self, dir: &str) -> BackendResult<Vec<ObjectInfo>>;
}

/// Lifts an [`ObjectBackend`] to the [`Storage`] contract.
pub struct BackendStorage<B> {
    backend: B,
}

impl<B: ObjectBackend> BackendStorage<B> {
    /// Wraps a backend.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Walks `dir` breadth-first, emitting entries before descending into them.
    async fn walk(
        &self,
        dir: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        let max_depth = opts.effective_depth();
        let mut pending = VecDeque::from([(dir.to_string(), 1usize)]);
        while let Some((current, depth)) = pending.pop_front() {
            let children = match self.backend.list_dir(&current).await {
                Ok(children) => children,
                Err(BackendError::DirNotFound) if current != dir => {
                    debug!(dir = %current, "directory vanished during walk");
                    continue;
                }
                Err(err) => return Err(err.into_storage(&current)),
            };
            for child in children {
                let entry = child.to_entry();
                if child.is_dir && max_depth.map_or(true, |max| depth < max) {
                    pending.push_back((child.path.clone(), depth + 1));
                }
                if opts.accepts(&entry) {
                    callback(entry)?;
                }
            }
        }
        Ok(())
    }

    async fn probe_file(&self, path: &str) -> BackendResult<ObjectInfo> {
        self.backend.stat_object(path).await
    }

    /// [`Self::walk`], with a missing root treated as empty.
    async fn walk_from(
        &self,
        dir: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        match self.walk(dir, opts, callback).await {
            Err(err) if dir.is_empty() && err.is_dir_not_found() => {
                debug!(backend = self.backend.name(), "missing root listed as empty");
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl<B: ObjectBackend> Storage for BackendStorage<B> {
    async fn push(&self, source: Source, path: &str) -> StorageResult<()> {
        let rpath = path::normalize(path);
        if path::has_dir_marker(path) || rpath.is_empty() {
            return Err(StorageError::invalid_path(path, "cannot push to a directory path"));
        }
        match self.backend.stat_object(&rpath).await {
            Err(BackendError::IsDir) => return Err(StorageError::is_directory(rpath)),
            Ok(_) | Err(BackendError::NotFound) => {}
            Err(err) => return Err(err.into_storage(&rpath)),
        }
        let (reader, len) = source.into_parts();
        let result = match len {
            Some(size) => {
                debug!(backend = self.backend.name(), path = %rpath, size, "sized upload");
                self.backend.put_sized(&rpath, reader, size).await
            }
            None => {
                if !self.backend.supports_streaming() {
                    warn!(
                        backend = self.backend.name(),
                        path = %rpath,
                        "backend cannot stream uploads, it may buffer the object before sending"
                    );
                }
                self.backend.put_stream(&rpath, reader).await
            }
        };
        result.map_err(|err| err.into_storage(&rpath).context(format!("push {rpath}")))
    }

    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()> {
        let mut reader = self.open(path, 0, None).await?;
        tokio::io::copy(&mut reader, sink)
            .await
            .map_err(|err| StorageError::from_io(err).context(format!("pull {path}")))?;
        tokio::io::AsyncWriteExt::flush(sink).await?;
        Ok(())
    }

    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream> {
        let rpath = path::normalize(path);
        if path::has_dir_marker(path) || rpath.is_empty() {
            return Err(StorageError::is_directory(path));
        }
        self.probe_file(&rpath)
            .await
            .map_err(|err| err.into_storage(&rpath))?;
        self.backend
            .get(&rpath, ByteRange { offset, length })
            .await
            .map_err(|err| err.into_storage(&rpath).context(format!("open {rpath}")))
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let rpath = path::normalize(path);
        if recursive {
            return match self.backend.purge(&rpath).await {
                Ok(()) => Ok(()),
                Err(BackendError::DirNotFound) => match self.backend.delete(&rpath).await {
                    Ok(()) => Ok(()),
                    Err(BackendError::NotFound) => Err(StorageError::dir_not_found(rpath)),
                    Err(err) => Err(err.into_storage(&rpath)),
                },
                Err(err) => Err(err.into_storage(&rpath).context(format!("purge {rpath}"))),
            };
        }
        match self.backend.delete(&rpath).await {
            Ok(()) => Ok(()),
            Err(BackendError::NotFound) => {
                debug!(path = %rpath, "remove of missing object");
                Ok(())
            }
            Err(err) => Err(err.into_storage(&rpath).context(format!("remove {rpath}"))),
        }
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let rpath = path::normalize(path);
        self.backend
            .mkdir(&rpath)
            .await
            .map_err(|err| err.into_storage(&rpath).context(format!("mkdir {rpath}")))
    }

    async fn rmdir(&self, path: &str) -> StorageResult<()> {
        let rpath = path::normalize(path);
        match self.backend.rmdir(&rpath).await {
            Ok(()) | Err(BackendError::DirNotFound) => Ok(()),
            Err(err) => Err(err.into_storage(&rpath).context(format!("rmdir {rpath}"))),
        }
    }

    async fn list_with(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        let rpath = path::normalize(path);
        let dir_hint = path::has_dir_marker(path) || rpath.is_empty();
        if !dir_hint {
            match self.probe_file(&rpath).await {
                Ok(info) => {
                    let entry = info.to_entry();
                    if opts.accepts(&entry) {
                        callback(entry)?;
                    }
                    return Ok(());
                }
                Err(BackendError::NotFound) if opts.path_is_file => {
                    return Err(StorageError::not_found(rpath))
                }
                Err(BackendError::IsDir) if opts.path_is_file => {
                    return Err(StorageError::is_directory(rpath))
                }
                Err(BackendError::NotFound) | Err(BackendError::IsDir) => {}
                Err(err) => return Err(err.into_storage(&rpath)),
            }
        } else if opts.path_is_file {
            return Err(StorageError::is_directory(path));
        }
        self.walk_from(&rpath, opts, callback).await
    }

    async fn stat(&self, path: &str) -> StorageResult<StatResult> {
        let rpath = path::normalize(path);
        if !path::has_dir_marker(path) && !rpath.is_empty() {
            match self.probe_file(&rpath).await {
                Ok(info) => return Ok(StatResult::single_file(info.size)),
                Err(BackendError::NotFound) | Err(BackendError::IsDir) => {}
                Err(err) => return Err(err.into_storage(&rpath)),
            }
        }
        let mut stat = StatResult::default();
        let mut tally = |entry: DirEntry| -> StorageResult<()> {
            stat.record(&entry);
            Ok(())
        };
        self.walk_from(&rpath, &ListOptions::recursive(), &mut tally).await?;
        Ok(stat)
    }

    fn layer_name(&self) -> &'static str {
        self.backend.name()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

//! Path confinement.
//!
//! [`SanitizedStorage`] presents a fixed base path inside its inner storage
//! as the root. Caller paths are cleaned and rejected if they climb above
//! the base; listed paths are rewritten relative to the base on the way out.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult, StorageResultExt};
use crate::path;
use crate::storage::{ListCallback, Storage};
use crate::types::{ByteStream, DirEntry, ListOptions, Sink, Source, StatResult};

/// Confines an inner storage beneath a base path.
pub struct SanitizedStorage {
    base: String,
    inner: Arc<dyn Storage>,
}

impl SanitizedStorage {
    /// Wraps `inner`, confining every path beneath `base_path`.
    pub fn new(base_path: &str, inner: Arc<dyn Storage>) -> StorageResult<Self> {
        let base = verified_base_path(base_path)?;
        debug!(base = %base, inner = inner.layer_name(), "sanitized layer");
        Ok(Self { base, inner })
    }

    /// [`SanitizedStorage::new`] as a stack layer.
    pub fn wrap(base_path: &str, inner: Arc<dyn Storage>) -> StorageResult<Arc<dyn Storage>> {
        Ok(Arc::new(Self::new(base_path, inner)?))
    }

    /// The cleaned base path, `""` when unconfined.
    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// The path handed to the inner storage for a caller path.
    fn relocate(&self, caller: &str) -> StorageResult<String> {
        let cleaned = path::clean(caller);
        let trimmed = cleaned.trim_start_matches('/');
        let relative = if trimmed.is_empty() { "." } else { trimmed };
        if path::escapes(relative) {
            return Err(StorageError::invalid_path(caller, "path escapes the base path"));
        }
        Ok(if self.base.is_empty() {
            relative.to_string()
        } else {
            path::join(&self.base, relative)
        })
    }

    /// Like [`Self::relocate`], but keeps a trailing separator so lower
    /// layers can tell a directory probe from a file probe.
    fn relocate_keep_dir(&self, caller: &str) -> StorageResult<String> {
        let relocated = self.relocate(caller)?;
        Ok(if path::has_dir_marker(caller) {
            path::with_dir_marker(&relocated)
        } else {
            relocated
        })
    }

    fn present(&self, entry: DirEntry) -> DirEntry {
        if self.base.is_empty() {
            return entry;
        }
        let inner_path = entry.path().trim_end_matches('/');
        match path::relative_to(&self.base, inner_path) {
            Some(rel) => entry.relocated(rel),
            None => {
                warn!(base = %self.base, path = entry.path(), "entry outside base path");
                entry
            }
        }
    }
}

fn verified_base_path(base_path: &str) -> StorageResult<String> {
    if base_path.is_empty() {
        return Ok(String::new());
    }
    let cleaned = path::clean(base_path);
    if path::escapes(&cleaned) {
        return Err(StorageError::invalid_path(base_path, "base path escapes the root"));
    }
    Ok(path::normalize(&cleaned))
}

#[async_trait]
impl Storage for SanitizedStorage {
    async fn push(&self, source: Source, path: &str) -> StorageResult<()> {
        if path::has_dir_marker(path) {
            return Err(StorageError::invalid_path(path, "cannot push to a directory path"));
        }
        let rpath = self.relocate(path)?;
        self.inner
            .push(source, &rpath)
            .await
            .with_context(|| format!("push {path}"))
    }

    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()> {
        if path::has_dir_marker(path) {
            return Err(StorageError::is_directory(path));
        }
        let rpath = self.relocate(path)?;
        self.inner
            .pull(&rpath, sink)
            .await
            .with_context(|| format!("pull {path}"))
    }

    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream> {
        if path::has_dir_marker(path) {
            return Err(StorageError::is_directory(path));
        }
        let rpath = self.relocate(path)?;
        self.inner
            .open(&rpath, offset, length)
            .await
            .with_context(|| format!("open {path}"))
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        let rpath = self.relocate(path)?;
        self.inner
            .remove(&rpath, recursive)
            .await
            .with_context(|| format!("remove {path}"))
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        let rpath = self.relocate(path)?;
        self.inner
            .mkdir(&rpath)
            .await
            .with_context(|| format!("mkdir {path}"))
    }

    async fn rmdir(&self, path: &str) -> StorageResult<()> {
        let rpath = self.relocate(path)?;
        self.inner
            .rmdir(&rpath)
            .await
            .with_context(|| format!("rmdir {path}"))
    }

    async fn list_with(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        if opts.path_is_file && path::has_dir_marker(path) {
            return Err(StorageError::invalid_path(
                path,
                "a path ending with a separator cannot be a file",
            ));
        }
        let rpath = self.relocate_keep_dir(path)?;
        let mut present = |entry: DirEntry| callback(self.present(entry));
        match self.inner.list_with(&rpath, opts, &mut present).await {
            Err(err) if err.is_dir_not_found() && path::normalize(path).is_empty() => {
                debug!(base = %self.base, "missing root listed as empty");
                Ok(())
            }
            other => other.with_context(|| format!("list {path}")),
        }
    }

    async fn stat(&self, path: &str) -> StorageResult<StatResult> {
        let rpath = self.relocate_keep_dir(path)?;
        match self.inner.stat(&rpath).await {
            Err(err) if err.is_dir_not_found() && path::normalize(path).is_empty() => {
                Ok(StatResult::default())
            }
            other => other.with_context(|| format!("stat {path}")),
        }
    }

    fn inner(&self) -> Option<&Arc<dyn Storage>> {
        Some(&self.inner)
    }

    fn layer_name(&self) -> &'static str {
        "sanitized"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

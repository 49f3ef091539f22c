//! Whole-blob access to the storage stack that holds a repository.

use crate::error::ReduceResult;
use bytes::Bytes;
use std::sync::Arc;
use stowage_storage::{DirEntry, ListOptions, Source, Storage};
use tracing::debug;

/// Reads and writes repository blobs as whole byte buffers.
#[derive(Clone)]
pub struct BlobStore {
    storage: Arc<dyn Storage>,
}

impl BlobStore {
    /// Store blobs in `storage`, which is rooted at the repository.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Underlying storage
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Write (or overwrite) a blob
    pub async fn put(&self, path: &str, data: impl Into<Bytes>) -> ReduceResult<()> {
        let data = data.into();
        debug!(path, len = data.len(), "put blob");
        self.storage.push(Source::from_bytes(data), path).await?;
        Ok(())
    }

    /// Read a blob; `None` if it does not exist
    pub async fn get(&self, path: &str) -> ReduceResult<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        match self.storage.pull(path, &mut buf).await {
            Ok(()) => Ok(Some(buf)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob. Deleting a missing blob succeeds.
    pub async fn delete(&self, path: &str) -> ReduceResult<()> {
        debug!(path, "delete blob");
        match self.storage.remove(path, false).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Every blob under `dir`, recursively. A missing directory is empty.
    pub async fn list(&self, dir: &str) -> ReduceResult<Vec<DirEntry>> {
        let opts = ListOptions {
            files_only: true,
            ..ListOptions::recursive()
        };
        match self.storage.list(dir, &opts).await {
            Ok(entries) => Ok(entries),
            Err(e) if e.is_dir_not_found() || e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// True if nothing at all is stored
    pub async fn is_empty(&self) -> ReduceResult<bool> {
        match self.storage.list("", &ListOptions::default()).await {
            Ok(entries) => Ok(entries.is_empty()),
            Err(e) if e.is_dir_not_found() => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

//! The storage contract implemented by backends and by every wrapper layer.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::types::{ByteStream, DirEntry, ListOptions, Sink, Source, StatResult};

/// Streaming listing callback. Returning an error stops the traversal and the
/// error is propagated out of `list_with`.
pub type ListCallback<'a> = dyn FnMut(DirEntry) -> StorageResult<()> + Send + 'a;

/// A path-addressed object store.
///
/// Stacks are built as `Arc<dyn Storage>`; each wrapper holds its inner layer
/// and exposes it through [`Storage::inner`] so tooling can walk the stack.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Replaces the object at `path` with the bytes of `source`.
    async fn push(&self, source: Source, path: &str) -> StorageResult<()>;

    /// Copies the full content of `path` into `sink`.
    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()>;

    /// Opens `path` for reading `[offset, offset + length)`; `None` reads to the end.
    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream>;

    /// Deletes one object, or a whole tree when `recursive`.
    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()>;

    /// Creates an empty directory marker.
    async fn mkdir(&self, path: &str) -> StorageResult<()>;

    /// Removes an empty directory marker.
    async fn rmdir(&self, path: &str) -> StorageResult<()>;

    /// Streams the entries under `path` (or the single entry `path` names) to `callback`.
    async fn list_with(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()>;

    /// Collects the entries under `path`.
    async fn list(&self, path: &str, opts: &ListOptions) -> StorageResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut collect = |entry: DirEntry| -> StorageResult<()> {
            entries.push(entry);
            Ok(())
        };
        self.list_with(path, opts, &mut collect).await?;
        Ok(entries)
    }

    /// Aggregates sizes and counts under `path`.
    async fn stat(&self, path: &str) -> StorageResult<StatResult>;

    /// The storage this layer wraps, if any.
    fn inner(&self) -> Option<&Arc<dyn Storage>> {
        None
    }

    /// Short name of this layer for diagnostics.
    fn layer_name(&self) -> &'static str;

    /// Typed access for stack introspection.
    fn as_any(&self) -> &dyn Any;
}

/// Stat computed by a recursive listing.
pub async fn stat_by_listing<S>(storage: &S, path: &str) -> StorageResult<StatResult>
where
    S: Storage + ?Sized,
{
    let mut stat = StatResult::default();
    let mut tally = |entry: DirEntry| -> StorageResult<()> {
        stat.record(&entry);
        Ok(())
    };
    storage
        .list_with(path, &ListOptions::recursive(), &mut tally)
        .await?;
    Ok(stat)
}

/// Layer names from the outermost layer inwards, e.g. `["sanitized", "encrypted", "backend:local"]`.
pub fn describe_stack(storage: &dyn Storage) -> Vec<&'static str> {
    let mut names = vec![storage.layer_name()];
    let mut current = storage.inner();
    while let Some(layer) = current {
        names.push(layer.layer_name());
        current = layer.inner();
    }
    names
}

/// Finds the first layer of type `T`, starting at `storage` and walking inwards.
pub fn find_layer<T: Storage>(storage: &dyn Storage) -> Option<&T> {
    if let Some(found) = storage.as_any().downcast_ref::<T>() {
        return Some(found);
    }
    let mut current = storage.inner();
    while let Some(layer) = current {
        if let Some(found) = layer.as_any().downcast_ref::<T>() {
            return Some(found);
        }
        current = layer.inner();
    }
    None
}

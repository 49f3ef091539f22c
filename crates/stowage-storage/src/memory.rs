//! In-memory backend for tests and ephemeral stacks.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::backend::{BackendError, BackendResult, ByteRange, ObjectBackend, ObjectInfo};
use crate::types::ByteStream;

/// Operation counters for the memory backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryBackendStats {
    /// Uploads with a known length.
    pub sized_puts: u64,
    /// Uploads of unknown length.
    pub stream_puts: u64,
    /// Range reads.
    pub gets: u64,
    /// Object deletions.
    pub deletes: u64,
    /// Directory listings.
    pub list_calls: u64,
    /// Bytes currently stored.
    pub total_bytes_stored: u64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mod_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    dirs: BTreeSet<String>,
    stats: MemoryBackendStats,
}

impl Inner {
    /// Rejects a path one of whose ancestors is stored as an object.
    fn check_parents(&self, path: &str) -> BackendResult<()> {
        let ancestor = path
            .match_indices('/')
            .map(|(idx, _)| &path[..idx])
            .find(|ancestor| self.objects.contains_key(*ancestor));
        match ancestor {
            Some(ancestor) => Err(BackendError::NotADirectory(ancestor.to_string())),
            None => Ok(()),
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() || self.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{path}/");
        self.objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
            || self
                .dirs
                .range(prefix.clone()..)
                .next()
                .is_some_and(|dir| dir.starts_with(&prefix))
    }
}

/// Objects held in a map, directories implied by object paths or created
/// explicitly with `mkdir`.
#[derive(Debug)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    streaming: bool,
}

impl MemoryBackend {
    /// An empty backend that accepts streamed uploads.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            streaming: true,
        }
    }

    /// An empty backend that reports it cannot stream uploads of unknown length.
    pub fn non_streaming() -> Self {
        Self {
            streaming: false,
            ..Self::new()
        }
    }

    /// Operation counters.
    pub fn stats(&self) -> MemoryBackendStats {
        self.inner.lock().stats.clone()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Paths of all stored objects, sorted.
    pub fn object_paths(&self) -> Vec<String> {
        self.inner.lock().objects.keys().cloned().collect()
    }

    /// Raw bytes of an object.
    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.inner.lock().objects.get(path).map(|obj| obj.data.clone())
    }

    fn store(&self, path: &str, data: Vec<u8>) -> BackendResult<()> {
        let mut inner = self.inner.lock();
        inner.check_parents(path)?;
        let added = data.len() as u64;
        let previous = inner.objects.insert(
            path.to_string(),
            StoredObject {
                data: Bytes::from(data),
                mod_time: Utc::now(),
            },
        );
        let removed = previous.map_or(0, |obj| obj.data.len() as u64);
        inner.stats.total_bytes_stored = inner
            .stats
            .total_bytes_stored
            .saturating_sub(removed)
            .saturating_add(added);
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn stat_object(&self, path: &str) -> BackendResult<ObjectInfo> {
        let inner = self.inner.lock();
        match inner.objects.get(path) {
            Some(obj) => Ok(ObjectInfo {
                path: path.to_string(),
                is_dir: false,
                size: obj.data.len() as u64,
                mod_time: obj.mod_time,
            }),
            None if inner.is_dir(path) => Err(BackendError::IsDir),
            None => Err(BackendError::NotFound),
        }
    }

    async fn put_sized(&self, path: &str, mut reader: ByteStream, size: u64) -> BackendResult<()> {
        self.inner.lock().check_parents(path)?;
        let mut data = Vec::with_capacity(size.min(64 << 20) as usize);
        reader.read_to_end(&mut data).await?;
        if data.len() as u64 != size {
            return Err(BackendError::SizeMismatch {
                expected: size,
                actual: data.len() as u64,
            });
        }
        self.store(path, data)?;
        self.inner.lock().stats.sized_puts += 1;
        debug!(path, size, "memory sized put");
        Ok(())
    }

    async fn put_stream(&self, path: &str, mut reader: ByteStream) -> BackendResult<()> {
        self.inner.lock().check_parents(path)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let size = data.len();
        self.store(path, data)?;
        self.inner.lock().stats.stream_puts += 1;
        debug!(path, size, "memory stream put");
        Ok(())
    }

    async fn get(&self, path: &str, range: ByteRange) -> BackendResult<ByteStream> {
        let mut inner = self.inner.lock();
        inner.stats.gets += 1;
        let data = match inner.objects.get(path) {
            Some(obj) => obj.data.clone(),
            None if inner.is_dir(path) => return Err(BackendError::IsDir),
            None => return Err(BackendError::NotFound),
        };
        let start = (range.offset.min(data.len() as u64)) as usize;
        let end = match range.length {
            Some(length) => start.saturating_add(length as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Box::new(std::io::Cursor::new(data.slice(start..end))))
    }

    async fn delete(&self, path: &str) -> BackendResult<()> {
        let mut inner = self.inner.lock();
        match inner.objects.remove(path) {
            Some(obj) => {
                inner.stats.deletes += 1;
                inner.stats.total_bytes_stored = inner
                    .stats
                    .total_bytes_stored
                    .saturating_sub(obj.data.len() as u64);
                Ok(())
            }
            None if inner.is_dir(path) => Err(BackendError::IsDir),
            None => Err(BackendError::NotFound),
        }
    }

    async fn purge(&self, dir: &str) -> BackendResult<()> {
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(dir) || !inner.is_dir(dir) {
            return Err(BackendError::DirNotFound);
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let doomed: Vec<String> = inner
            .objects
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(obj) = inner.objects.remove(&key) {
                inner.stats.deletes += 1;
                inner.stats.total_bytes_stored = inner
                    .stats
                    .total_bytes_stored
                    .saturating_sub(obj.data.len() as u64);
            }
        }
        inner
            .dirs
            .retain(|d| d.as_str() != dir && !d.starts_with(&prefix));
        Ok(())
    }

    async fn mkdir(&self, dir: &str) -> BackendResult<()> {
        if dir.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(dir) {
            return Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{dir} is a file"),
            )));
        }
        inner.check_parents(dir)?;
        let mut current = String::new();
        for part in dir.split('/') {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            inner.dirs.insert(current.clone());
        }
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> BackendResult<()> {
        if dir.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if !inner.is_dir(dir) {
            return Err(BackendError::DirNotFound);
        }
        let prefix = format!("{dir}/");
        let has_children = inner.objects.keys().any(|key| key.starts_with(&prefix))
            || inner.dirs.iter().any(|d| d.starts_with(&prefix));
        if has_children {
            return Err(BackendError::NotEmpty);
        }
        inner.dirs.remove(dir);
        Ok(())
    }

    async fn list_dir(&self, dir: &str) -> BackendResult<Vec<ObjectInfo>> {
        let mut inner = self.inner.lock();
        inner.stats.list_calls += 1;
        if inner.objects.contains_key(dir) || !inner.is_dir(dir) {
            return Err(BackendError::DirNotFound);
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut children: BTreeMap<String, ObjectInfo> = BTreeMap::new();
        for (key, obj) in inner.objects.iter().filter(|(k, _)| k.starts_with(&prefix)) {
            let rest = &key[prefix.len()..];
            match rest.split_once('/') {
                None => {
                    children.insert(
                        key.clone(),
                        ObjectInfo {
                            path: key.clone(),
                            is_dir: false,
                            size: obj.data.len() as u64,
                            mod_time: obj.mod_time,
                        },
                    );
                }
                Some((child, _)) => {
                    let child_path = format!("{prefix}{child}");
                    let entry = children.entry(child_path.clone()).or_insert(ObjectInfo {
                        path: child_path,
                        is_dir: true,
                        size: 0,
                        mod_time: obj.mod_time,
                    });
                    entry.mod_time = entry.mod_time.max(obj.mod_time);
                }
            }
        }
        for explicit in inner.dirs.iter().filter(|d| d.starts_with(&prefix)) {
            let rest = &explicit[prefix.len()..];
            let child = rest.split('/').next().unwrap_or(rest);
            if child.is_empty() {
                continue;
            }
            let child_path = format!("{prefix}{child}");
            children.entry(child_path.clone()).or_insert(ObjectInfo {
                path: child_path,
                is_dir: true,
                size: 0,
                mod_time: DateTime::<Utc>::UNIX_EPOCH,
            });
        }
        Ok(children.into_values().collect())
    }
}

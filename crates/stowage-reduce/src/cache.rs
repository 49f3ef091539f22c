//! Local on-disk cache of chunk envelopes.
//!
//! Envelopes are cached sealed, exactly as stored, so the cache never holds
//! plaintext. The cache is bounded; the least recently written files are
//! evicted first.

use crate::fingerprint::ChunkHash;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};

/// Default cache bound
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 256 * 1024 * 1024;

/// Cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Identity of the repository configuration; names the cache directory
    pub cache_id: String,
    /// Turn the cache off entirely
    pub disabled: bool,
    /// Parent directory; defaults to `<tmp>/stowage-cache`
    pub base_dir: Option<PathBuf>,
    /// Upper bound on cached bytes
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_id: "default".to_string(),
            disabled: false,
            base_dir: None,
            max_bytes: DEFAULT_MAX_CACHE_BYTES,
        }
    }
}

impl CacheConfig {
    /// Directory this configuration caches into
    pub fn directory(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stowage-cache"))
            .join(&self.cache_id)
    }
}

/// Bounded chunk envelope cache
#[derive(Debug)]
pub struct ChunkCache {
    dir: Option<PathBuf>,
    max_bytes: u64,
    used: Mutex<u64>,
}

impl ChunkCache {
    /// A cache that stores nothing
    pub fn disabled() -> Self {
        Self {
            dir: None,
            max_bytes: 0,
            used: Mutex::new(0),
        }
    }

    /// Open (creating if needed) the cache directory for `config`.
    /// Failure to create it disables the cache with a warning.
    pub async fn open(config: &CacheConfig) -> Self {
        if config.disabled {
            return Self::disabled();
        }
        let dir = config.directory();
        if let Err(e) = fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "cannot create chunk cache, caching disabled");
            return Self::disabled();
        }
        let used = scan(&dir).await.iter().map(|(_, len, _)| len).sum();
        debug!(dir = %dir.display(), used, max = config.max_bytes, "chunk cache opened");
        Self {
            dir: Some(dir),
            max_bytes: config.max_bytes,
            used: Mutex::new(used),
        }
    }

    /// Cache directory, `None` when disabled
    pub fn directory(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Bytes currently cached
    pub fn used_bytes(&self) -> u64 {
        *self.used.lock()
    }

    /// Cached envelope for `hash`
    pub async fn get(&self, hash: &ChunkHash) -> Option<Vec<u8>> {
        let dir = self.dir.as_ref()?;
        fs::read(dir.join(hash.to_hex())).await.ok()
    }

    /// Cache an envelope. Errors are logged and otherwise ignored.
    pub async fn put(&self, hash: &ChunkHash, envelope: &[u8]) {
        let Some(dir) = &self.dir else { return };
        if envelope.len() as u64 > self.max_bytes {
            return;
        }
        let target = dir.join(hash.to_hex());
        let tmp = dir.join(format!(".{}.{}", hash.to_hex(), uuid::Uuid::new_v4().simple()));
        let written = async {
            fs::write(&tmp, envelope).await?;
            fs::rename(&tmp, &target).await
        }
        .await;
        if let Err(e) = written {
            debug!(hash = %hash, error = %e, "chunk cache write failed");
            let _ = fs::remove_file(&tmp).await;
            return;
        }
        let over = {
            let mut used = self.used.lock();
            *used += envelope.len() as u64;
            *used > self.max_bytes
        };
        if over {
            self.evict(dir).await;
        }
    }

    /// Remove a cached envelope
    pub async fn remove(&self, hash: &ChunkHash) {
        let Some(dir) = &self.dir else { return };
        let path = dir.join(hash.to_hex());
        if let Ok(meta) = fs::metadata(&path).await {
            if fs::remove_file(&path).await.is_ok() {
                let mut used = self.used.lock();
                *used = used.saturating_sub(meta.len());
            }
        }
    }

    async fn evict(&self, dir: &Path) {
        let mut files = scan(dir).await;
        files.sort_by_key(|(_, _, modified)| *modified);
        let mut total: u64 = files.iter().map(|(_, len, _)| len).sum();
        let target = self.max_bytes / 10 * 9;
        let mut evicted = 0usize;
        for (path, len, _) in files {
            if total <= target {
                break;
            }
            if fs::remove_file(&path).await.is_ok() {
                total -= len;
                evicted += 1;
            }
        }
        *self.used.lock() = total;
        debug!(evicted, used = total, "chunk cache evicted");
    }
}

async fn scan(dir: &Path) -> Vec<(PathBuf, u64, SystemTime)> {
    let mut out = Vec::new();
    let Ok(mut rd) = fs::read_dir(dir).await else {
        return out;
    };
    while let Ok(Some(entry)) = rd.next_entry().await {
        let Ok(meta) = entry.metadata().await else { continue };
        if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((entry.path(), meta.len(), modified));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;

    fn config(dir: &Path, max_bytes: u64) -> CacheConfig {
        CacheConfig {
            cache_id: "test".to_string(),
            disabled: false,
            base_dir: Some(dir.to_path_buf()),
            max_bytes,
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(&config(tmp.path(), 1 << 20)).await;
        let h = blake3_hash(b"x");
        assert!(cache.get(&h).await.is_none());
        cache.put(&h, b"envelope").await;
        assert_eq!(cache.get(&h).await.as_deref(), Some(&b"envelope"[..]));
        assert_eq!(cache.used_bytes(), 8);
        assert!(tmp.path().join("test").join(h.to_hex()).exists());
        cache.remove(&h).await;
        assert!(cache.get(&h).await.is_none());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path(), 1 << 20);
        cfg.disabled = true;
        let cache = ChunkCache::open(&cfg).await;
        let h = blake3_hash(b"x");
        cache.put(&h, b"envelope").await;
        assert!(cache.get(&h).await.is_none());
        assert!(cache.directory().is_none());
    }

    #[tokio::test]
    async fn eviction_keeps_cache_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ChunkCache::open(&config(tmp.path(), 1000)).await;
        for i in 0..10u8 {
            cache.put(&blake3_hash(&[i]), &[i; 300]).await;
        }
        assert!(cache.used_bytes() <= 1000);
        let on_disk: u64 = scan(&tmp.path().join("test")).await.iter().map(|(_, l, _)| l).sum();
        assert_eq!(on_disk, cache.used_bytes());
    }

    #[test]
    fn default_directory_is_under_tmp() {
        let cfg = CacheConfig {
            cache_id: "abc".to_string(),
            ..CacheConfig::default()
        };
        assert!(cfg.directory().ends_with("stowage-cache/abc"));
    }
}

//! The snapshot repository: bootstrap, keys, content index, and reads.
//!
//! A [`Repository`] lives in any [`Storage`] stack. It is created on first
//! open against an empty location with fixed algorithm choices, after which
//! every open must present the same password.

use crate::blob::BlobStore;
use crate::cache::{CacheConfig, ChunkCache};
use crate::compression::{compress_adaptive, decompress, CompressionAlgorithm};
use crate::dedupe::{ChunkInfo, ChunkerConfig, ContentIndex, IndexDelta};
use crate::encryption::{
    decrypt, derive_chunk_key, derive_master_key, derive_purpose_key, encrypt, open_document,
    seal_document, EncryptedChunk, EncryptionKey,
};
use crate::error::{ReduceError, ReduceResult};
use crate::fingerprint::{blake3_hash, ChunkHash};
use crate::format::{
    chunk_path, index_path, manifest_path, MaintenanceParams, RepositoryFormat, DEFAULT_PASSWORD,
    FORMAT_BLOB, INDEX_DIR, KEY_CHECK_PLAINTEXT, MAINTENANCE_BLOB, MANIFEST_DIR,
};
use crate::manifest::Manifest;
use crate::session::WriteSession;
use bytes::Bytes;
use chrono::Utc;
use futures::stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stowage_storage::{ByteStream, Storage};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

const DOCUMENT_KEY_PURPOSE: &str = "documents";

/// Options for [`Repository::open_or_init`]
#[derive(Debug, Clone, Default)]
pub struct RepositoryOptions {
    /// Local chunk cache
    pub cache: CacheConfig,
    /// Chunk size bounds used only when the repository is created
    pub splitter: Option<ChunkerConfig>,
}

/// Stored form of one chunk
#[derive(Serialize, Deserialize)]
struct ChunkEnvelope {
    compression: CompressionAlgorithm,
    sealed: EncryptedChunk,
}

struct Shared {
    blobs: BlobStore,
    format: RepositoryFormat,
    master_key: EncryptionKey,
    document_key: EncryptionKey,
    index: RwLock<ContentIndex>,
    cache: ChunkCache,
    write_lock: Arc<Mutex<()>>,
}

/// Handle to an opened repository. Cheap to clone.
#[derive(Clone)]
pub struct Repository {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("unique_id", &self.shared.format.unique_id)
            .field("chunks", &self.shared.index.read().len())
            .finish()
    }
}

impl Repository {
    /// Open the repository stored in `storage`, creating it if the location
    /// is empty. An empty password selects the built-in default.
    pub async fn open_or_init(
        storage: Arc<dyn Storage>,
        password: &str,
        options: RepositoryOptions,
    ) -> ReduceResult<Self> {
        let password = if password.is_empty() {
            DEFAULT_PASSWORD
        } else {
            password
        };
        let blobs = BlobStore::new(storage);
        let (format, master_key, document_key) = match blobs.get(FORMAT_BLOB).await? {
            Some(raw) => {
                let format: RepositoryFormat = serde_json::from_slice(&raw)?;
                format.validate()?;
                let (master, doc) = derive_keys(password, &format)?;
                match open_document::<String>(&format.key_check, &doc) {
                    Ok(check) if check == KEY_CHECK_PLAINTEXT => {}
                    Ok(_) | Err(ReduceError::DecryptionAuthFailed) => {
                        return Err(ReduceError::InvalidPassword)
                    }
                    Err(e) => return Err(e),
                }
                debug!(unique_id = %format.unique_id, "opened repository");
                (format, master, doc)
            }
            None => initialize(&blobs, password, &options).await?,
        };

        let mut index = ContentIndex::new();
        for entry in blobs.list(INDEX_DIR).await? {
            if let Some(raw) = blobs.get(entry.path()).await? {
                index.merge(&open_document::<IndexDelta>(&raw, &document_key)?);
            }
        }

        let cache = ChunkCache::open(&options.cache).await;
        Ok(Self {
            shared: Arc::new(Shared {
                blobs,
                format,
                master_key,
                document_key,
                index: RwLock::new(index),
                cache,
                write_lock: Arc::new(Mutex::new(())),
            }),
        })
    }

    /// Format document
    pub fn format(&self) -> &RepositoryFormat {
        &self.shared.format
    }

    /// Random id assigned at creation
    pub fn unique_id(&self) -> &str {
        &self.shared.format.unique_id
    }

    /// True when index deltas can be compacted by quick maintenance
    pub fn supports_epoch_compaction(&self) -> bool {
        self.shared.format.epoch_index
    }

    /// Number of chunks the content index knows about
    pub fn chunk_count(&self) -> usize {
        self.shared.index.read().len()
    }

    /// Local chunk cache
    pub fn cache(&self) -> &ChunkCache {
        &self.shared.cache
    }

    /// Start a write session. Sessions and maintenance runs are serialized.
    pub async fn new_write_session(&self) -> WriteSession {
        let guard = self.lock_writes().await;
        WriteSession::new(self.clone(), guard)
    }

    pub(crate) async fn lock_writes(&self) -> OwnedMutexGuard<()> {
        self.shared.write_lock.clone().lock_owned().await
    }

    pub(crate) fn blobs(&self) -> &BlobStore {
        &self.shared.blobs
    }

    pub(crate) fn index(&self) -> &RwLock<ContentIndex> {
        &self.shared.index
    }

    pub(crate) fn chunker_config(&self) -> &ChunkerConfig {
        &self.shared.format.splitter
    }

    pub(crate) fn seal<T: Serialize>(&self, value: &T) -> ReduceResult<Vec<u8>> {
        seal_document(value, &self.shared.document_key, self.shared.format.encryption)
    }

    pub(crate) fn unseal<T: serde::de::DeserializeOwned>(&self, raw: &[u8]) -> ReduceResult<T> {
        open_document(raw, &self.shared.document_key)
    }

    /// Ids of every committed manifest
    pub async fn list_manifests(&self) -> ReduceResult<Vec<String>> {
        Ok(self
            .shared
            .blobs
            .list(MANIFEST_DIR)
            .await?
            .into_iter()
            .map(|e| e.name().to_string())
            .collect())
    }

    /// Load a committed manifest
    pub async fn load_manifest(&self, id: &str) -> ReduceResult<Manifest> {
        let raw = self
            .shared
            .blobs
            .get(&manifest_path(id))
            .await?
            .ok_or_else(|| ReduceError::ManifestNotFound(id.to_string()))?;
        self.unseal(&raw)
    }

    /// Current maintenance parameters
    pub async fn maintenance_params(&self) -> ReduceResult<MaintenanceParams> {
        match self.shared.blobs.get(MAINTENANCE_BLOB).await? {
            Some(raw) => self.unseal(&raw),
            None => Ok(MaintenanceParams::defaults(self.supports_epoch_compaction())),
        }
    }

    /// Replace the maintenance parameters
    pub async fn set_maintenance_params(&self, params: &MaintenanceParams) -> ReduceResult<()> {
        self.shared
            .blobs
            .put(MAINTENANCE_BLOB, self.seal(params)?)
            .await
    }

    /// Materialize entry `name` of manifest `id` as a byte stream of
    /// `[offset, offset + length)`; `None` reads to the end. Chunks wholly
    /// before `offset` are never fetched.
    pub async fn open_file(
        &self,
        id: &str,
        name: &str,
        offset: u64,
        length: Option<u64>,
    ) -> ReduceResult<ByteStream> {
        let manifest = self.load_manifest(id).await?;
        if manifest.entry.name != name {
            return Err(ReduceError::EntryNotFound {
                manifest: id.to_string(),
                name: name.to_string(),
            });
        }
        let (first, skip) = match manifest.entry.locate(offset) {
            Some(found) => found,
            None => return Ok(Box::new(tokio::io::empty())),
        };
        let chunks = manifest.entry.chunks[first..].to_vec();
        let repo = self.clone();
        let chunk_stream = stream::try_unfold(
            (repo, chunks.into_iter(), skip as usize),
            |(repo, mut rest, skip)| async move {
                let Some(chunk) = rest.next() else {
                    return Ok(None);
                };
                let data = repo
                    .read_chunk(&chunk.hash)
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                let data = data.slice(skip.min(data.len())..);
                Ok::<_, std::io::Error>(Some((data, (repo, rest, 0))))
            },
        );
        let reader = StreamReader::new(Box::pin(chunk_stream));
        Ok(match length {
            Some(len) => Box::new(reader.take(len)),
            None => Box::new(reader),
        })
    }

    /// Fetch, open and verify one chunk
    pub async fn read_chunk(&self, hash: &ChunkHash) -> ReduceResult<Bytes> {
        let (raw, cached) = match self.shared.cache.get(hash).await {
            Some(raw) => (raw, true),
            None => (
                self.shared
                    .blobs
                    .get(&chunk_path(hash))
                    .await?
                    .ok_or_else(|| ReduceError::ChunkNotFound(hash.to_hex()))?,
                false,
            ),
        };
        let envelope: ChunkEnvelope = bincode::deserialize(&raw)?;
        let key = derive_chunk_key(&self.shared.master_key, hash.as_bytes())?;
        let packed = decrypt(&envelope.sealed, &key)?;
        let plain = decompress(&packed, envelope.compression)?;
        if blake3_hash(&plain) != *hash {
            if cached {
                self.shared.cache.remove(hash).await;
            }
            return Err(ReduceError::IntegrityMismatch(hash.to_hex()));
        }
        if !cached {
            self.shared.cache.put(hash, &raw).await;
        }
        Ok(Bytes::from(plain))
    }

    /// Compress, seal and store one chunk
    pub(crate) async fn write_chunk(&self, hash: &ChunkHash, data: &[u8]) -> ReduceResult<ChunkInfo> {
        let (packed, compression) = compress_adaptive(data, self.shared.format.compression)?;
        let key = derive_chunk_key(&self.shared.master_key, hash.as_bytes())?;
        let sealed = encrypt(&packed, &key, self.shared.format.encryption)?;
        let raw = bincode::serialize(&ChunkEnvelope { compression, sealed })?;
        let stored_size = raw.len() as u64;
        self.shared.blobs.put(&chunk_path(hash), raw).await?;
        Ok(ChunkInfo {
            original_size: data.len() as u64,
            stored_size,
            written_at: Utc::now(),
        })
    }

    /// Persist an index delta and fold it into the in-memory index
    pub(crate) async fn write_index_delta(&self, id: &str, delta: &IndexDelta) -> ReduceResult<()> {
        self.shared.blobs.put(&index_path(id), self.seal(delta)?).await?;
        self.shared.index.write().merge(delta);
        Ok(())
    }
}

fn derive_keys(
    password: &str,
    format: &RepositoryFormat,
) -> ReduceResult<(EncryptionKey, EncryptionKey)> {
    let master = derive_master_key(password.as_bytes(), format.unique_id.as_bytes())?;
    let document = derive_purpose_key(&master, DOCUMENT_KEY_PURPOSE)?;
    Ok((master, document))
}

async fn initialize(
    blobs: &BlobStore,
    password: &str,
    options: &RepositoryOptions,
) -> ReduceResult<(RepositoryFormat, EncryptionKey, EncryptionKey)> {
    if !blobs.is_empty().await? {
        return Err(ReduceError::NotEmpty(
            "found existing data but no repository format".to_string(),
        ));
    }
    let mut format = RepositoryFormat::new();
    if let Some(splitter) = &options.splitter {
        format.splitter = splitter.clone();
    }
    let (master, doc) = derive_keys(password, &format)?;
    format.key_check = seal_document(&KEY_CHECK_PLAINTEXT, &doc, format.encryption)?;

    let params = MaintenanceParams::defaults(format.epoch_index);
    blobs
        .put(MAINTENANCE_BLOB, seal_document(&params, &doc, format.encryption)?)
        .await?;
    blobs.put(FORMAT_BLOB, serde_json::to_vec_pretty(&format)?).await?;
    info!(
        unique_id = %format.unique_id,
        hash = %format.hash,
        owner = %params.owner,
        "initialized repository"
    );
    Ok((format, master, doc))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use stowage_storage::{BackendStorage, MemoryBackend, Source};
    use tokio::io::AsyncReadExt;

    pub(crate) fn small_options() -> RepositoryOptions {
        RepositoryOptions {
            cache: CacheConfig {
                disabled: true,
                ..CacheConfig::default()
            },
            splitter: Some(ChunkerConfig {
                min_size: 1024,
                avg_size: 4096,
                max_size: 16 * 1024,
            }),
        }
    }

    pub(crate) fn memory_storage() -> Arc<dyn Storage> {
        Arc::new(BackendStorage::new(MemoryBackend::new()))
    }

    pub(crate) fn sample(len: usize, seed: u64) -> Vec<u8> {
        let mut x = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (x >> 33) as u8
            })
            .collect()
    }

    async fn read_all(mut r: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn init_then_reopen() {
        let storage = memory_storage();
        let repo = Repository::open_or_init(storage.clone(), "pw", small_options())
            .await
            .unwrap();
        assert!(repo.supports_epoch_compaction());
        let again = Repository::open_or_init(storage, "pw", small_options())
            .await
            .unwrap();
        assert_eq!(repo.unique_id(), again.unique_id());
        let params = again.maintenance_params().await.unwrap();
        assert!(!params.quick_cycle.enabled);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let storage = memory_storage();
        Repository::open_or_init(storage.clone(), "right", small_options())
            .await
            .unwrap();
        let err = Repository::open_or_init(storage, "wrong", small_options())
            .await
            .unwrap_err();
        assert!(matches!(err, ReduceError::InvalidPassword));
    }

    #[tokio::test]
    async fn empty_password_uses_default() {
        let storage = memory_storage();
        Repository::open_or_init(storage.clone(), "", small_options())
            .await
            .unwrap();
        Repository::open_or_init(storage, DEFAULT_PASSWORD, small_options())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refuses_to_initialize_over_foreign_data() {
        let storage = memory_storage();
        storage
            .push(Source::from_bytes(&b"stray"[..]), "stray")
            .await
            .unwrap();
        let err = Repository::open_or_init(storage, "pw", small_options())
            .await
            .unwrap_err();
        assert!(matches!(err, ReduceError::NotEmpty(_)));
    }

    #[tokio::test]
    async fn ranged_open_skips_leading_chunks() {
        let repo = Repository::open_or_init(memory_storage(), "pw", small_options())
            .await
            .unwrap();
        let data = sample(100_000, 1);
        let mut session = repo.new_write_session().await;
        let summary = session.snapshot_single("f", &data[..]).await.unwrap();
        session.commit().await.unwrap();

        let whole = read_all(repo.open_file(&summary.id, "f", 0, None).await.unwrap()).await;
        assert_eq!(whole, data);
        let part = read_all(
            repo.open_file(&summary.id, "f", 40_000, Some(25_000))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(part, &data[40_000..65_000]);
        let tail = read_all(repo.open_file(&summary.id, "f", 99_990, None).await.unwrap()).await;
        assert_eq!(tail, &data[99_990..]);
        let past = read_all(repo.open_file(&summary.id, "f", 200_000, None).await.unwrap()).await;
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn wrong_entry_name_and_missing_manifest() {
        let repo = Repository::open_or_init(memory_storage(), "pw", small_options())
            .await
            .unwrap();
        let mut session = repo.new_write_session().await;
        let summary = session.snapshot_single("f", &b"abc"[..]).await.unwrap();
        session.commit().await.unwrap();
        assert!(matches!(
            repo.open_file(&summary.id, "g", 0, None).await,
            Err(ReduceError::EntryNotFound { .. })
        ));
        assert!(matches!(
            repo.open_file("nope", "f", 0, None).await,
            Err(ReduceError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cached_chunks_are_served_locally() {
        let tmp = tempfile::tempdir().unwrap();
        let mut options = small_options();
        options.cache = CacheConfig {
            cache_id: "repo".to_string(),
            disabled: false,
            base_dir: Some(tmp.path().to_path_buf()),
            max_bytes: 1 << 20,
        };
        let repo = Repository::open_or_init(memory_storage(), "pw", options)
            .await
            .unwrap();
        let mut session = repo.new_write_session().await;
        let summary = session.snapshot_single("f", &b"cached"[..]).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(repo.cache().used_bytes(), 0);
        let first = read_all(repo.open_file(&summary.id, "f", 0, None).await.unwrap()).await;
        assert!(repo.cache().used_bytes() > 0);
        let second = read_all(repo.open_file(&summary.id, "f", 0, None).await.unwrap()).await;
        assert_eq!(first, b"cached");
        assert_eq!(second, b"cached");
    }
}

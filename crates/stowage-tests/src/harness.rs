//! Test Harness - stacks, fault injection and call recording

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use stowage_cas::record::meta_path;
use stowage_cas::CasStorage;
use stowage_reduce::{CacheConfig, ChunkerConfig, Repository, RepositoryOptions};
use stowage_storage::{
    BackendStorage, ByteStream, ListCallback, ListOptions, MemoryBackend, SanitizedStorage, Sink,
    Source, StatResult, Storage, StorageError, StorageResult,
};
use tempfile::TempDir;

/// General-purpose test environment with a scratch directory
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }
}

/// Deterministic pseudo-random payload
pub fn sample(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// A memory backend plus the same backend as a stack layer
pub fn memory_backend() -> (Arc<BackendStorage<MemoryBackend>>, Arc<dyn Storage>) {
    let backend = Arc::new(BackendStorage::new(MemoryBackend::new()));
    let layer: Arc<dyn Storage> = backend.clone();
    (backend, layer)
}

/// Repository options with small chunks and no cache
pub fn small_repository_options() -> RepositoryOptions {
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

/// Content-addressable layer over `backend` at `root`, with the engine and
/// sidecar stores passed through `engine_wrap` and `sidecar_wrap` so tests
/// can interpose faults or recorders.
pub async fn cas_with(
    backend: Arc<dyn Storage>,
    root: &str,
    engine_wrap: impl FnOnce(Arc<dyn Storage>) -> Arc<dyn Storage>,
    sidecar_wrap: impl FnOnce(Arc<dyn Storage>) -> Arc<dyn Storage>,
) -> CasStorage {
    let engine = SanitizedStorage::wrap(root, backend.clone()).expect("engine root");
    let sidecar = SanitizedStorage::wrap(&meta_path(root), backend).expect("sidecar root");
    let repo = Repository::open_or_init(engine_wrap(engine), "", small_repository_options())
        .await
        .expect("open repository");
    CasStorage::new(repo, sidecar_wrap(sidecar))
}

/// Content-addressable layer over `backend` with no interposed layers
pub async fn plain_cas(backend: Arc<dyn Storage>) -> CasStorage {
    cas_with(backend, "repo", |s| s, |s| s).await
}

/// Pull `path` into memory
pub async fn pull_all(storage: &dyn Storage, path: &str) -> StorageResult<Vec<u8>> {
    let mut out = Vec::new();
    storage.pull(path, &mut out).await?;
    Ok(out)
}

/// A mutating call seen by [`RecordingStorage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Push(String),
    Remove(String),
    Rmdir(String),
}

/// Pass-through layer that records every mutating call
pub struct RecordingStorage {
    inner: Arc<dyn Storage>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingStorage {
    pub fn wrap(inner: Arc<dyn Storage>, calls: Arc<Mutex<Vec<Call>>>) -> Arc<dyn Storage> {
        Arc::new(Self { inner, calls })
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn push(&self, source: Source, path: &str) -> StorageResult<()> {
        self.calls.lock().push(Call::Push(path.to_string()));
        self.inner.push(source, path).await
    }

    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()> {
        self.inner.pull(path, sink).await
    }

    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream> {
        self.inner.open(path, offset, length).await
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        self.calls.lock().push(Call::Remove(path.to_string()));
        self.inner.remove(path, recursive).await
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        self.inner.mkdir(path).await
    }

    async fn rmdir(&self, path: &str) -> StorageResult<()> {
        self.calls.lock().push(Call::Rmdir(path.to_string()));
        self.inner.rmdir(path).await
    }

    async fn list_with(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        self.inner.list_with(path, opts, callback).await
    }

    async fn stat(&self, path: &str) -> StorageResult<StatResult> {
        self.inner.stat(path).await
    }

    fn inner(&self) -> Option<&Arc<dyn Storage>> {
        Some(&self.inner)
    }

    fn layer_name(&self) -> &'static str {
        "recording"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type PathFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Operation a [`FaultyStorage`] fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    Push,
    List,
}

/// Pass-through layer whose pushes (or listings) fail while armed and the
/// path matches
pub struct FaultyStorage {
    inner: Arc<dyn Storage>,
    armed: Arc<Mutex<bool>>,
    fails: PathFilter,
    target: FaultTarget,
}

impl FaultyStorage {
    pub fn wrap(
        inner: Arc<dyn Storage>,
        armed: Arc<Mutex<bool>>,
        fails: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Arc<dyn Storage> {
        Self::wrap_target(inner, armed, fails, FaultTarget::Push)
    }

    /// Like [`FaultyStorage::wrap`], but listings fail with a backend error.
    pub fn wrap_listing(
        inner: Arc<dyn Storage>,
        armed: Arc<Mutex<bool>>,
        fails: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Arc<dyn Storage> {
        Self::wrap_target(inner, armed, fails, FaultTarget::List)
    }

    fn wrap_target(
        inner: Arc<dyn Storage>,
        armed: Arc<Mutex<bool>>,
        fails: impl Fn(&str) -> bool + Send + Sync + 'static,
        target: FaultTarget,
    ) -> Arc<dyn Storage> {
        Arc::new(Self {
            inner,
            armed,
            fails: Box::new(fails),
            target,
        })
    }

    fn trips(&self, target: FaultTarget, path: &str) -> bool {
        self.target == target && *self.armed.lock() && (self.fails)(path)
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn push(&self, source: Source, path: &str) -> StorageResult<()> {
        if self.trips(FaultTarget::Push, path) {
            return Err(StorageError::from_io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("injected failure pushing {path}"),
            )));
        }
        self.inner.push(source, path).await
    }

    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()> {
        self.inner.pull(path, sink).await
    }

    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream> {
        self.inner.open(path, offset, length).await
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        self.inner.remove(path, recursive).await
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        self.inner.mkdir(path).await
    }

    async fn rmdir(&self, path: &str) -> StorageResult<()> {
        self.inner.rmdir(path).await
    }

    async fn list_with(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        if self.trips(FaultTarget::List, path) {
            return Err(StorageError::Backend(format!("injected failure listing {path}")));
        }
        self.inner.list_with(path, opts, callback).await
    }

    async fn stat(&self, path: &str) -> StorageResult<StatResult> {
        self.inner.stat(path).await
    }

    fn inner(&self) -> Option<&Arc<dyn Storage>> {
        Some(&self.inner)
    }

    fn layer_name(&self) -> &'static str {
        "faulty"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

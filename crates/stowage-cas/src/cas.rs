//! Path-addressed storage over the snapshot engine.
//!
//! Object bytes live in a [`Repository`] as one single-entry version per
//! push. A sidecar [`Storage`] holds one small [`MetaRecord`] per logical
//! path naming the live version, so the record is the source of truth: an
//! object exists exactly when its record does.
//!
//! An overwrite first copies the live record to a shadow record, commits the
//! new version, rewrites the live record and only then retires the shadow and
//! the version it names. Until the live record is rewritten, readers see the
//! previous content. A shadow left behind by an interrupted push is reclaimed
//! on the next push to the same path, or by [`CasStorage::reclaim_leaked_shadows`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stowage_reduce::{Repository, SafetyLevel};
use stowage_storage::{
    path, stat_by_listing, ByteStream, DirEntry, ListCallback, ListOptions, SanitizedStorage, Sink,
    Source, StatResult, Storage, StorageError, StorageResult, StorageResultExt,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::CasConfig;
use crate::error::{engine_error, SoftError, SoftOp};
use crate::maintenance::MaintenanceReport;
use crate::record::{self, check_leaf, meta_path, shadow_meta_path, MetaRecord};

/// Outcome of a push
#[derive(Debug, Clone)]
pub struct PushReport {
    /// Version now live at the path
    pub version: String,
    /// Bytes stored
    pub size: u64,
    /// Commit time of the version
    pub mod_time: DateTime<Utc>,
    /// Version that was replaced, if any
    pub replaced: Option<String>,
    /// Best-effort steps that failed
    pub soft_errors: Vec<SoftError>,
}

/// Outcome of a removal
#[derive(Debug, Clone, Default)]
pub struct RemoveReport {
    /// Objects removed
    pub files_removed: usize,
    /// Directories removed
    pub dirs_removed: usize,
    /// Best-effort steps that failed
    pub soft_errors: Vec<SoftError>,
}

/// Outcome of a listing
#[derive(Debug, Clone, Default)]
pub struct ListReport {
    /// Entries handed to the callback
    pub entries: usize,
    /// Sidecar entries that were skipped
    pub soft_errors: Vec<SoftError>,
}

/// Outcome of a shadow sweep
#[derive(Debug, Clone, Default)]
pub struct ReclaimReport {
    /// Shadows reclaimed
    pub reclaimed: usize,
    /// Shadows that could not be reclaimed
    pub soft_errors: Vec<SoftError>,
}

type PathLocks = DashMap<String, Arc<Mutex<()>>>;

/// Holds one path's lock; the map entry goes away with the last holder.
struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so a count of one means only the map is left.
        self.locks
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Content-addressable storage layer
pub struct CasStorage {
    repo: Repository,
    sidecar: Arc<dyn Storage>,
    locks: PathLocks,
}

impl CasStorage {
    /// Layer over an opened repository and a sidecar store for records.
    pub fn new(repo: Repository, sidecar: Arc<dyn Storage>) -> Self {
        Self {
            repo,
            sidecar,
            locks: DashMap::new(),
        }
    }

    /// Open (initializing if needed) the repository described by `config`
    /// inside `backend`. The repository lives at the configured root and the
    /// sidecar next to it, at `<root>.~meta`. `base_path` only feeds the
    /// cache identity.
    pub async fn connect(
        config: &CasConfig,
        backend: Arc<dyn Storage>,
        base_path: &str,
    ) -> StorageResult<Self> {
        let root = config.validated_root()?;
        let sidecar = SanitizedStorage::wrap(&meta_path(&root), backend.clone())?;
        let engine = SanitizedStorage::wrap(&root, backend)?;
        let repo = Repository::open_or_init(engine, &config.password, config.repository_options(base_path))
            .await
            .map_err(|e| engine_error(e, format!("open repository at {root:?}")))?;
        info!(root = %root, repository = %repo.unique_id(), "content-addressable layer ready");
        Ok(Self::new(repo, sidecar))
    }

    /// The snapshot repository
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// The record store
    pub fn sidecar(&self) -> &Arc<dyn Storage> {
        &self.sidecar
    }

    async fn path_lock(&self, path: &str) -> PathGuard<'_> {
        let lock = self.locks.entry(path.to_string()).or_default().clone();
        PathGuard {
            locks: &self.locks,
            path: path.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn read_record_at(&self, sidecar_path: &str) -> StorageResult<Option<MetaRecord>> {
        let mut raw = Vec::new();
        match self.sidecar.pull(sidecar_path, &mut raw).await {
            Ok(()) => Ok(Some(MetaRecord::decode(&raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.context(format!("read record {sidecar_path}"))),
        }
    }

    async fn load_record(&self, path: &str) -> StorageResult<MetaRecord> {
        self.read_record_at(&meta_path(path))
            .await?
            .ok_or_else(|| StorageError::not_found(path))
    }

    async fn write_record(&self, sidecar_path: &str, record: &MetaRecord) -> StorageResult<()> {
        self.sidecar
            .push(Source::from_bytes(record.encode()?), sidecar_path)
            .await
    }

    async fn delete_version(&self, version: &str) -> StorageResult<()> {
        let mut session = self.repo.new_write_session().await;
        session.delete_manifest(version);
        session
            .commit()
            .await
            .map_err(|e| engine_error(e, format!("delete version {version}")))
    }

    /// The error for a path with no record: a directory or simply missing.
    async fn missing(&self, path: &str) -> StorageError {
        if path::is_root(path) {
            return StorageError::is_directory(path);
        }
        let probe = ListOptions {
            max_depth: Some(1),
            ..ListOptions::default()
        };
        match self.sidecar.list(path, &probe).await {
            Ok(_) => StorageError::is_directory(path),
            Err(e) if e.is_not_found() || e.is_dir_not_found() => StorageError::not_found(path),
            Err(e) => e.context(format!("probe {path}")),
        }
    }

    /// Push, returning what happened including best-effort failures.
    pub async fn push_reporting(&self, source: Source, path: &str) -> StorageResult<PushReport> {
        info!(path, "cas push");
        let name = path::base_name(path);
        if path::has_dir_marker(path) || path::is_root(path) || matches!(name, "" | "." | "..") {
            return Err(StorageError::invalid_path(path, "cannot push to a directory path"));
        }
        check_leaf(path)?;
        let _guard = self.path_lock(path).await;
        let mut soft_errors = Vec::new();

        if let Err(e) = self.reclaim_shadow(path).await {
            warn!(path, error = %e, "unable to reclaim leaked shadow");
            soft_errors.push(SoftError::new(SoftOp::ShadowReclaim, path, e));
        }

        let previous = self.read_record_at(&meta_path(path)).await?;
        let shadow = shadow_meta_path(path);
        if let Some(prev) = &previous {
            self.write_record(&shadow, prev)
                .await
                .with_context(|| format!("unable to save previous record of {path}"))?;
        }

        let committed = async {
            let mut session = self.repo.new_write_session().await;
            let summary = session
                .snapshot_single(name, source.into_reader())
                .await
                .map_err(|e| engine_error(e, format!("snapshot {path}")))?;
            session
                .commit()
                .await
                .map_err(|e| engine_error(e, format!("commit {path}")))?;
            Ok::<_, StorageError>(summary)
        }
        .await;
        let summary = match committed {
            Ok(summary) => summary,
            Err(e) => {
                self.discard_shadow(&shadow, previous.is_some()).await;
                return Err(e);
            }
        };

        let record = MetaRecord {
            name: name.to_string(),
            size: summary.size,
            mod_time: summary.end_time,
            version: summary.id.clone(),
        };
        if let Err(e) = self.write_record(&meta_path(path), &record).await {
            if let Err(cleanup) = self.delete_version(&summary.id).await {
                debug!(path, version = %summary.id, error = %cleanup, "orphaned version left for maintenance");
            }
            self.discard_shadow(&shadow, previous.is_some()).await;
            return Err(e.context(format!("write record of {path}")));
        }

        if let Some(prev) = &previous {
            let retired = async {
                self.delete_version(&prev.version).await?;
                self.sidecar.remove(&shadow, false).await
            }
            .await;
            if let Err(e) = retired {
                warn!(path, version = %prev.version, error = %e, "unable to remove the shadowed version");
                soft_errors.push(SoftError::new(SoftOp::ShadowCleanup, path, e));
            }
        }

        debug!(path, version = %record.version, size = record.size, "push committed");
        Ok(PushReport {
            version: record.version,
            size: record.size,
            mod_time: record.mod_time,
            replaced: previous.map(|p| p.version),
            soft_errors,
        })
    }

    /// Drop a shadow record whose version is still live.
    async fn discard_shadow(&self, shadow: &str, created: bool) {
        if created {
            if let Err(e) = self.sidecar.remove(shadow, false).await {
                debug!(shadow, error = %e, "shadow left for the next push");
            }
        }
    }

    /// Reclaim a shadow left for `path` by an interrupted push. The caller
    /// holds the path lock. Returns whether a shadow was found.
    async fn reclaim_shadow(&self, path: &str) -> StorageResult<bool> {
        let shadow_path = shadow_meta_path(path);
        let Some(shadow) = self.read_record_at(&shadow_path).await? else {
            return Ok(false);
        };
        let live = self.read_record_at(&meta_path(path)).await?;
        if live.as_ref().map(|l| l.version.as_str()) != Some(shadow.version.as_str()) {
            self.delete_version(&shadow.version).await?;
        }
        self.sidecar.remove(&shadow_path, false).await?;
        info!(path, version = %shadow.version, "reclaimed leaked shadow");
        Ok(true)
    }

    /// Sweep the whole namespace for leaked shadows.
    pub async fn reclaim_leaked_shadows(&self) -> StorageResult<ReclaimReport> {
        let opts = ListOptions {
            files_only: true,
            ..ListOptions::recursive()
        };
        let mut report = ReclaimReport::default();
        for entry in self.sidecar.list("", &opts).await? {
            let Some((live, true)) = record::logical_path(entry.path()) else {
                continue;
            };
            let _guard = self.path_lock(live).await;
            match self.reclaim_shadow(live).await {
                Ok(true) => report.reclaimed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = live, error = %e, "unable to reclaim leaked shadow");
                    report
                        .soft_errors
                        .push(SoftError::new(SoftOp::ShadowReclaim, live, e));
                }
            }
        }
        Ok(report)
    }

    /// Delete the version named by the record at `sidecar_path`, then the record.
    async fn remove_record_at(&self, sidecar_path: &str, path: &str) -> StorageResult<()> {
        let record = self
            .read_record_at(sidecar_path)
            .await?
            .ok_or_else(|| StorageError::not_found(path))?;
        self.delete_version(&record.version).await?;
        self.sidecar
            .remove(sidecar_path, false)
            .await
            .with_context(|| format!("remove record of {path}"))
    }

    async fn remove_one(&self, path: &str) -> StorageResult<()> {
        let _guard = self.path_lock(path).await;
        self.remove_record_at(&meta_path(path), path).await
    }

    /// Remove, returning what happened including best-effort failures.
    pub async fn remove_reporting(&self, path: &str, recursive: bool) -> StorageResult<RemoveReport> {
        info!(path, recursive, "cas remove");
        let mut report = RemoveReport::default();
        let names_dir = path::has_dir_marker(path) || path::is_root(path);
        if !recursive {
            if names_dir {
                self.sidecar.remove(path, false).await?;
                return Ok(report);
            }
            check_leaf(path)?;
            self.remove_one(path).await?;
            report.files_removed = 1;
            return Ok(report);
        }

        let entries = match self.sidecar.list(path, &ListOptions::recursive()).await {
            Ok(entries) => entries,
            Err(e) if e.is_dir_not_found() && !names_dir => {
                if self.read_record_at(&meta_path(path)).await?.is_none() {
                    return Err(e);
                }
                self.remove_one(path).await?;
                report.files_removed = 1;
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let mut dirs = vec![path.to_string()];
        for entry in entries {
            if entry.is_dir() {
                debug!(dir = entry.path(), "queued for removal");
                dirs.push(entry.path().to_string());
                continue;
            }
            match record::logical_path(entry.path()) {
                Some((live, false)) => {
                    self.remove_one(live)
                        .await
                        .with_context(|| format!("fail to remove {live}"))?;
                    report.files_removed += 1;
                }
                Some((live, true)) => {
                    let _guard = self.path_lock(live).await;
                    match self.remove_record_at(entry.path(), live).await {
                        Err(e) if !e.is_not_found() => {
                            return Err(e.context(format!("fail to remove shadow of {live}")))
                        }
                        _ => {}
                    }
                }
                None => {
                    warn!(path = entry.path(), "skipping non-record sidecar object");
                    report
                        .soft_errors
                        .push(SoftError::new(SoftOp::StrayEntry, entry.path(), "not a metadata record"));
                }
            }
        }

        for dir in dirs.iter().rev() {
            match self.sidecar.rmdir(dir).await {
                Ok(()) => report.dirs_removed += 1,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "fail to rmdir");
                    report.soft_errors.push(SoftError::new(SoftOp::Rmdir, dir.as_str(), e));
                }
            }
        }
        Ok(report)
    }

    /// List, returning what happened including skipped sidecar entries.
    pub async fn list_reporting(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<ListReport> {
        info!(path, ?opts, "cas list");
        let mut report = ListReport::default();
        let names_dir = path::has_dir_marker(path) || path::is_root(path);
        if !names_dir {
            check_leaf(path)?;
            if let Some(record) = self.read_record_at(&meta_path(path)).await? {
                let entry = DirEntry::file(path::base_name(path), path, record.size, record.mod_time);
                if opts.accepts(&entry) {
                    callback(entry)?;
                    report.entries = 1;
                }
                return Ok(report);
            }
        }
        if opts.path_is_file {
            return Err(if path::has_dir_marker(path) {
                StorageError::is_directory(path)
            } else {
                StorageError::not_found(path)
            });
        }

        let sidecar_opts = ListOptions {
            path_is_file: false,
            ..opts.clone()
        };
        for entry in self.sidecar.list(path, &sidecar_opts).await? {
            if entry.is_dir() {
                callback(entry)?;
                report.entries += 1;
                continue;
            }
            match record::logical_path(entry.path()) {
                Some((_, true)) => {}
                Some((live, false)) => {
                    let Some(record) = self.read_record_at(entry.path()).await? else {
                        debug!(path = live, "record vanished while listing");
                        continue;
                    };
                    callback(DirEntry::file(path::base_name(live), live, record.size, record.mod_time))?;
                    report.entries += 1;
                }
                None => {
                    warn!(path = entry.path(), "listing non-record sidecar object");
                    report
                        .soft_errors
                        .push(SoftError::new(SoftOp::StrayEntry, entry.path(), "not a metadata record"));
                }
            }
        }
        Ok(report)
    }

    /// Reclaim leaked shadows, then run engine maintenance. Runs quick
    /// maintenance when the repository lacks epoch compaction, full
    /// otherwise, and always overrides the ownership check.
    pub async fn run_maintenance(&self, safety: SafetyLevel) -> StorageResult<MaintenanceReport> {
        let reclaim = self.reclaim_leaked_shadows().await?;
        let mode = if self.repo.supports_epoch_compaction() {
            stowage_reduce::MaintenanceMode::Full
        } else {
            stowage_reduce::MaintenanceMode::Quick
        };
        info!(mode = ?mode, safety = ?safety, "cas maintenance");
        let stats = stowage_reduce::maintenance::run(&self.repo, mode, true, safety)
            .await
            .map_err(|e| engine_error(e, "maintenance"))?;
        Ok(MaintenanceReport { reclaim, stats })
    }
}

#[async_trait]
impl Storage for CasStorage {
    async fn push(&self, source: Source, path: &str) -> StorageResult<()> {
        self.push_reporting(source, path).await.map(|_| ())
    }

    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()> {
        info!(path, "cas pull");
        let mut reader = self.open(path, 0, None).await?;
        tokio::io::copy(&mut reader, sink)
            .await
            .map_err(|e| StorageError::from_io(e).context(format!("copy {path}")))?;
        sink.flush().await?;
        Ok(())
    }

    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream> {
        debug!(path, offset, ?length, "cas open");
        if path::has_dir_marker(path) {
            return Err(StorageError::is_directory(path));
        }
        check_leaf(path)?;
        let record = match self.load_record(path).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Err(self.missing(path).await),
            Err(e) => return Err(e),
        };
        self.repo
            .open_file(&record.version, &record.name, offset, length)
            .await
            .map_err(|e| engine_error(e, format!("open version {} of {path}", record.version)))
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        self.remove_reporting(path, recursive).await.map(|_| ())
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        info!(path, "cas mkdir");
        self.sidecar.mkdir(path).await
    }

    async fn rmdir(&self, path: &str) -> StorageResult<()> {
        info!(path, "cas rmdir");
        self.sidecar.rmdir(path).await
    }

    async fn list_with(
        &self,
        path: &str,
        opts: &ListOptions,
        callback: &mut ListCallback<'_>,
    ) -> StorageResult<()> {
        self.list_reporting(path, opts, callback).await.map(|_| ())
    }

    async fn stat(&self, path: &str) -> StorageResult<StatResult> {
        info!(path, "cas stat");
        if !path::has_dir_marker(path) && !path::is_root(path) {
            check_leaf(path)?;
            if let Some(record) = self.read_record_at(&meta_path(path)).await? {
                return Ok(StatResult::single_file(record.size));
            }
        }
        stat_by_listing(self, path).await
    }

    fn inner(&self) -> Option<&Arc<dyn Storage>> {
        Some(&self.sidecar)
    }

    fn layer_name(&self) -> &'static str {
        "cas"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

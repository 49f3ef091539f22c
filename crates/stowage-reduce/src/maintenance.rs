//! Repository maintenance: index compaction and mark-and-sweep of chunk blobs.
//!
//! Quick maintenance compacts the index deltas into one. Full maintenance
//! first marks every chunk referenced by a committed manifest and selects the
//! chunk blobs nobody references. The compacted index, without those chunks,
//! is persisted and the old deltas deleted before any chunk blob goes, so a
//! stored index never names a deleted chunk.

use crate::error::{ReduceError, ReduceResult};
use crate::fingerprint::ChunkHash;
use crate::format::{chunk_path, current_owner, index_path, CHUNK_DIR, INDEX_DIR};
use crate::repository::Repository;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// How much work a maintenance run does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceMode {
    /// Compact index deltas only
    Quick,
    /// Sweep unreferenced chunks, then compact
    Full,
}

/// How cautious the sweep is about chunks that may belong to a session in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SafetyLevel {
    /// Sweep every unreferenced chunk immediately
    None,
    /// Keep unreferenced chunks younger than [`SAFETY_MARGIN_SECS`]
    #[default]
    Full,
}

impl SafetyLevel {
    /// `"none"` (any case) selects [`SafetyLevel::None`]; anything else is full.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("none") {
            SafetyLevel::None
        } else {
            SafetyLevel::Full
        }
    }
}

/// Age below which full safety keeps unreferenced chunks
pub const SAFETY_MARGIN_SECS: i64 = 3600;

/// Statistics from a maintenance run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceStats {
    /// Mode that ran
    pub mode: MaintenanceMode,
    /// Index deltas replaced by the compacted one
    pub deltas_compacted: usize,
    /// Manifests scanned while marking
    pub manifests_scanned: usize,
    /// Chunk blobs found
    pub chunks_scanned: usize,
    /// Chunks referenced by at least one manifest
    pub chunks_referenced: usize,
    /// Chunks deleted
    pub chunks_swept: usize,
    /// Stored bytes deleted
    pub bytes_swept: u64,
    /// Unreferenced chunks kept because they were too young
    pub chunks_kept_young: usize,
}

impl MaintenanceStats {
    fn new(mode: MaintenanceMode) -> Self {
        Self {
            mode,
            deltas_compacted: 0,
            manifests_scanned: 0,
            chunks_scanned: 0,
            chunks_referenced: 0,
            chunks_swept: 0,
            bytes_swept: 0,
            chunks_kept_young: 0,
        }
    }
}

/// Run maintenance. Refuses with [`ReduceError::NotOwner`] unless this
/// process owns maintenance or `force` is set.
pub async fn run(
    repo: &Repository,
    mode: MaintenanceMode,
    force: bool,
    safety: SafetyLevel,
) -> ReduceResult<MaintenanceStats> {
    let _guard = repo.lock_writes().await;
    let mut params = repo.maintenance_params().await?;
    let current = current_owner();
    if params.owner != current {
        if !force {
            return Err(ReduceError::NotOwner {
                owner: params.owner,
                current,
            });
        }
        warn!(owner = %params.owner, current = %current, "forcing maintenance as non-owner");
    }

    let mut stats = MaintenanceStats::new(mode);
    let doomed = match mode {
        MaintenanceMode::Full => mark(repo, safety, &mut stats).await?,
        MaintenanceMode::Quick => Vec::new(),
    };
    compact_index(repo, &doomed, &mut stats).await?;
    sweep(repo, doomed, &mut stats).await?;

    let now = Utc::now();
    params.last_quick = Some(now);
    if mode == MaintenanceMode::Full {
        params.last_full = Some(now);
    }
    repo.set_maintenance_params(&params).await?;
    info!(
        mode = ?mode,
        safety = ?safety,
        swept = stats.chunks_swept,
        bytes = stats.bytes_swept,
        compacted = stats.deltas_compacted,
        "maintenance finished"
    );
    Ok(stats)
}

/// An unreferenced chunk blob selected for deletion
struct Doomed {
    hash: ChunkHash,
    size: u64,
}

/// Collect the chunk blobs no committed manifest references.
async fn mark(repo: &Repository, safety: SafetyLevel, stats: &mut MaintenanceStats) -> ReduceResult<Vec<Doomed>> {
    let mut referenced: HashSet<ChunkHash> = HashSet::new();
    for id in repo.list_manifests().await? {
        let manifest = repo.load_manifest(&id).await?;
        referenced.extend(manifest.chunk_hashes());
        stats.manifests_scanned += 1;
    }
    stats.chunks_referenced = referenced.len();
    debug!(manifests = stats.manifests_scanned, referenced = referenced.len(), "marked chunks");

    let cutoff = Utc::now() - Duration::seconds(SAFETY_MARGIN_SECS);
    let mut doomed = Vec::new();
    for entry in repo.blobs().list(CHUNK_DIR).await? {
        let Some(hash) = ChunkHash::from_hex(entry.name()) else {
            warn!(path = entry.path(), "ignoring foreign blob in chunk area");
            continue;
        };
        stats.chunks_scanned += 1;
        if referenced.contains(&hash) {
            continue;
        }
        if safety == SafetyLevel::Full && entry.mod_time() > cutoff {
            stats.chunks_kept_young += 1;
            continue;
        }
        doomed.push(Doomed {
            hash,
            size: entry.size(),
        });
    }
    Ok(doomed)
}

/// Delete the selected chunk blobs. Runs only once the stored index no
/// longer names them.
async fn sweep(repo: &Repository, doomed: Vec<Doomed>, stats: &mut MaintenanceStats) -> ReduceResult<()> {
    let blobs = repo.blobs();
    for chunk in doomed {
        repo.index().write().remove(&chunk.hash);
        repo.cache().remove(&chunk.hash).await;
        blobs.delete(&chunk_path(&chunk.hash)).await?;
        stats.chunks_swept += 1;
        stats.bytes_swept += chunk.size;
    }
    Ok(())
}

/// Replace every index delta with one holding the current index minus the
/// doomed chunks.
async fn compact_index(repo: &Repository, doomed: &[Doomed], stats: &mut MaintenanceStats) -> ReduceResult<()> {
    let blobs = repo.blobs();
    let old: Vec<String> = blobs
        .list(INDEX_DIR)
        .await?
        .into_iter()
        .map(|e| e.path().to_string())
        .collect();
    if old.len() <= 1 && doomed.is_empty() {
        return Ok(());
    }
    let delta = {
        let mut survivors = repo.index().read().clone();
        for chunk in doomed {
            survivors.remove(&chunk.hash);
        }
        survivors.to_delta()
    };
    let id = format!("compacted-{}", uuid::Uuid::new_v4().simple());
    if !delta.is_empty() {
        repo.write_index_delta(&id, &delta).await?;
    }
    let fresh = index_path(&id);
    for path in old.iter().filter(|p| **p != fresh) {
        blobs.delete(path).await?;
    }
    stats.deltas_compacted = old.len();
    Ok(())
}

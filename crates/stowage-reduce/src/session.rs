//! Write sessions: the only way content enters or leaves a repository.
//!
//! Chunk blobs are written while a stream is snapshotted, but manifests,
//! manifest deletions and the index delta only become visible on
//! [`WriteSession::commit`]. A session dropped before committing leaves no
//! manifest behind; its chunks are unreferenced and swept by full
//! maintenance.

use crate::dedupe::{Chunker, IndexDelta};
use crate::error::ReduceResult;
use crate::format::manifest_path;
use crate::manifest::{ChunkRef, Manifest, ManifestEntry, SourceInfo};
use crate::repository::Repository;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// What one snapshot produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSummary {
    /// Version handle of the new manifest
    pub id: String,
    /// Bytes snapshotted
    pub size: u64,
    /// When the last byte was stored
    pub end_time: DateTime<Utc>,
    /// Chunks that were new to the repository
    pub new_chunks: usize,
    /// Chunks that were already stored
    pub reused_chunks: usize,
}

/// Exclusive write access to a repository
pub struct WriteSession {
    repo: Repository,
    id: String,
    delta: IndexDelta,
    manifests: Vec<Manifest>,
    deletions: Vec<String>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteSession {
    pub(crate) fn new(repo: Repository, guard: OwnedMutexGuard<()>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        debug!(session = %id, "write session started");
        Self {
            repo,
            id,
            delta: IndexDelta::default(),
            manifests: Vec::new(),
            deletions: Vec::new(),
            _guard: guard,
        }
    }

    /// Session id; names the index delta written on commit
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Repository this session writes to
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Snapshot `reader` as a single entry named `name`.
    pub async fn snapshot_single<R>(&mut self, name: &str, reader: R) -> ReduceResult<SnapshotSummary>
    where
        R: AsyncRead + Unpin + Send,
    {
        let start_time = Utc::now();
        let mut chunks = Vec::new();
        let mut new_chunks = 0usize;
        let mut stream = Chunker::with_config(self.repo.chunker_config().clone()).stream(reader);
        while let Some(chunk) = stream.next_chunk().await? {
            let known = self.delta.contains(&chunk.hash) || self.repo.index().read().lookup(&chunk.hash);
            if !known {
                let info = self.repo.write_chunk(&chunk.hash, &chunk.data).await?;
                self.delta.insert(chunk.hash, info);
                new_chunks += 1;
            }
            chunks.push(ChunkRef {
                hash: chunk.hash,
                offset: chunk.offset,
                length: chunk.data.len() as u64,
            });
        }
        let size = stream.position();
        let end_time = Utc::now();
        let manifest = Manifest {
            id: Manifest::new_id(),
            source: SourceInfo::local(name),
            entry: ManifestEntry {
                name: name.to_string(),
                size,
                chunks,
            },
            start_time,
            end_time,
        };
        let summary = SnapshotSummary {
            id: manifest.id.clone(),
            size,
            end_time,
            new_chunks,
            reused_chunks: manifest.entry.chunks.len() - new_chunks,
        };
        debug!(
            session = %self.id,
            manifest = %summary.id,
            name,
            size,
            new_chunks,
            reused = summary.reused_chunks,
            "snapshot taken"
        );
        self.manifests.push(manifest);
        Ok(summary)
    }

    /// Queue deletion of a committed manifest. Deleting a manifest that does
    /// not exist succeeds.
    pub fn delete_manifest(&mut self, id: &str) {
        self.manifests.retain(|m| m.id != id);
        self.deletions.push(id.to_string());
    }

    /// Make everything this session did durable.
    pub async fn commit(self) -> ReduceResult<()> {
        let blobs = self.repo.blobs();
        if !self.delta.is_empty() {
            self.repo.write_index_delta(&self.id, &self.delta).await?;
        }
        for manifest in &self.manifests {
            blobs
                .put(&manifest_path(&manifest.id), self.repo.seal(manifest)?)
                .await?;
        }
        for id in &self.deletions {
            blobs.delete(&manifest_path(id)).await?;
        }
        info!(
            session = %self.id,
            manifests = self.manifests.len(),
            deleted = self.deletions.len(),
            chunks = self.delta.len(),
            "write session committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ReduceError;
    use crate::repository::tests::{memory_storage, sample, small_options};
    use crate::repository::Repository;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn snapshot_dedupes_repeated_content() {
        let repo = Repository::open_or_init(memory_storage(), "pw", small_options())
            .await
            .unwrap();
        let data = sample(80_000, 7);

        let mut session = repo.new_write_session().await;
        let first = session.snapshot_single("a", &data[..]).await.unwrap();
        let second = session.snapshot_single("b", &data[..]).await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(first.size, 80_000);
        assert!(first.new_chunks > 0);
        assert_eq!(second.new_chunks, 0);
        assert_eq!(second.reused_chunks, first.new_chunks + first.reused_chunks);
        assert_eq!(repo.chunk_count(), first.new_chunks);

        let mut session = repo.new_write_session().await;
        let third = session.snapshot_single("c", &data[..]).await.unwrap();
        assert_eq!(third.new_chunks, 0);
    }

    #[tokio::test]
    async fn dropped_session_leaves_no_manifest() {
        let repo = Repository::open_or_init(memory_storage(), "pw", small_options())
            .await
            .unwrap();
        {
            let mut session = repo.new_write_session().await;
            session.snapshot_single("a", &b"data"[..]).await.unwrap();
        }
        assert!(repo.list_manifests().await.unwrap().is_empty());
        assert_eq!(repo.chunk_count(), 0);
    }

    #[tokio::test]
    async fn delete_manifest_on_commit() {
        let repo = Repository::open_or_init(memory_storage(), "pw", small_options())
            .await
            .unwrap();
        let mut session = repo.new_write_session().await;
        let summary = session.snapshot_single("a", &b"data"[..]).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(repo.list_manifests().await.unwrap(), vec![summary.id.clone()]);

        let mut session = repo.new_write_session().await;
        session.delete_manifest(&summary.id);
        session.delete_manifest("never-existed");
        session.commit().await.unwrap();
        assert!(repo.list_manifests().await.unwrap().is_empty());
        assert!(matches!(
            repo.load_manifest(&summary.id).await,
            Err(ReduceError::ManifestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_stream_snapshots_to_empty_entry() {
        let repo = Repository::open_or_init(memory_storage(), "pw", small_options())
            .await
            .unwrap();
        let mut session = repo.new_write_session().await;
        let summary = session.snapshot_single("empty", &b""[..]).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(summary.size, 0);
        let mut out = Vec::new();
        repo.open_file(&summary.id, "empty", 0, None)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let storage = memory_storage();
        let repo = Repository::open_or_init(storage.clone(), "pw", small_options())
            .await
            .unwrap();
        let data = sample(30_000, 3);
        let mut session = repo.new_write_session().await;
        let first = session.snapshot_single("a", &data[..]).await.unwrap();
        session.commit().await.unwrap();

        let reopened = Repository::open_or_init(storage, "pw", small_options())
            .await
            .unwrap();
        assert_eq!(reopened.chunk_count(), first.new_chunks);
        let mut session = reopened.new_write_session().await;
        let again = session.snapshot_single("a", &data[..]).await.unwrap();
        assert_eq!(again.new_chunks, 0);
    }
}

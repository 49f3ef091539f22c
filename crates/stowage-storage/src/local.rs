//! Backend rooted at a directory on the local filesystem.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::backend::{BackendError, BackendResult, ByteRange, ObjectBackend, ObjectInfo};
use crate::path;
use crate::types::ByteStream;

/// Suffix of in-flight upload files; hidden from listings.
const PARTIAL_SUFFIX: &str = ".partial";

/// Stores objects as plain files under a root directory. Uploads go to a
/// temporary sibling first and are renamed into place once complete, so a
/// failed push never leaves a partial object behind.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Creates a backend rooted at `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &str) -> BackendResult<PathBuf> {
        let mut full = self.root.clone();
        if rel.is_empty() {
            return Ok(full);
        }
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => full.push(part),
                _ => {
                    return Err(BackendError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unexpected path component in {rel:?}"),
                    )))
                }
            }
        }
        Ok(full)
    }

    async fn write_atomically(
        &self,
        rel: &str,
        mut reader: ByteStream,
        expected: Option<u64>,
    ) -> BackendResult<()> {
        let target = self.resolve(rel)?;
        let parent = target.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await?;
        let temp = parent.join(format!(
            ".{}.{}{}",
            path::base_name(rel),
            uuid::Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));
        let outcome = async {
            let mut file = fs::File::create(&temp).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            if let Some(expected) = expected {
                if written != expected {
                    return Err(BackendError::SizeMismatch {
                        expected,
                        actual: written,
                    });
                }
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        match outcome {
            Ok(()) => {
                fs::rename(&temp, &target).await?;
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&temp).await {
                    debug!(temp = %temp.display(), error = %cleanup, "failed to drop partial upload");
                }
                Err(err)
            }
        }
    }
}

fn info_from_metadata(rel: String, meta: &std::fs::Metadata) -> ObjectInfo {
    let mod_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    ObjectInfo {
        path: rel,
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        mod_time,
    }
}

fn not_found_as(err: io::Error, mapped: BackendError) -> BackendError {
    if err.kind() == io::ErrorKind::NotFound {
        mapped
    } else {
        BackendError::Io(err)
    }
}

#[async_trait]
impl ObjectBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn stat_object(&self, path: &str) -> BackendResult<ObjectInfo> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::NotFound))?;
        if meta.is_dir() {
            return Err(BackendError::IsDir);
        }
        Ok(info_from_metadata(path.to_string(), &meta))
    }

    async fn put_sized(&self, path: &str, reader: ByteStream, size: u64) -> BackendResult<()> {
        self.write_atomically(path, reader, Some(size)).await
    }

    async fn put_stream(&self, path: &str, reader: ByteStream) -> BackendResult<()> {
        self.write_atomically(path, reader, None).await
    }

    async fn get(&self, path: &str, range: ByteRange) -> BackendResult<ByteStream> {
        let full = self.resolve(path)?;
        let mut file = fs::File::open(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::NotFound))?;
        if range.offset > 0 {
            file.seek(io::SeekFrom::Start(range.offset)).await?;
        }
        Ok(match range.length {
            Some(length) => Box::new(file.take(length)),
            None => Box::new(file),
        })
    }

    async fn delete(&self, path: &str) -> BackendResult<()> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::NotFound))?;
        if meta.is_dir() {
            return Err(BackendError::IsDir);
        }
        fs::remove_file(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::NotFound))
    }

    async fn purge(&self, dir: &str) -> BackendResult<()> {
        let full = self.resolve(dir)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::DirNotFound))?;
        if !meta.is_dir() {
            return Err(BackendError::DirNotFound);
        }
        if dir.is_empty() {
            let mut entries = fs::read_dir(&full).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_dir() {
                    fs::remove_dir_all(entry.path()).await?;
                } else {
                    fs::remove_file(entry.path()).await?;
                }
            }
            return Ok(());
        }
        fs::remove_dir_all(&full).await?;
        Ok(())
    }

    async fn mkdir(&self, dir: &str) -> BackendResult<()> {
        let full = self.resolve(dir)?;
        fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> BackendResult<()> {
        if dir.is_empty() {
            return Ok(());
        }
        let full = self.resolve(dir)?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::DirNotFound))?;
        if entries.next_entry().await?.is_some() {
            return Err(BackendError::NotEmpty);
        }
        fs::remove_dir(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::DirNotFound))
    }

    async fn list_dir(&self, dir: &str) -> BackendResult<Vec<ObjectInfo>> {
        let full = self.resolve(dir)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|err| not_found_as(err, BackendError::DirNotFound))?;
        if !meta.is_dir() {
            return Err(BackendError::DirNotFound);
        }
        let mut entries = fs::read_dir(&full).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            let rel = if dir.is_empty() {
                name
            } else {
                format!("{dir}/{name}")
            };
            out.push(info_from_metadata(rel, &meta));
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

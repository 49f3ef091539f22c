//! Values exchanged through the storage contract: directory entries, listing
//! options, stat aggregates and push sources.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// A readable byte stream handed across layers.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// A writable byte sink supplied by the caller of `pull`.
pub type Sink<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// One entry produced by a listing. Never mutated once created; layers derive
/// new entries with [`DirEntry::relocated`] or [`DirEntry::renamed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    is_dir: bool,
    name: String,
    path: String,
    size: u64,
    mod_time: DateTime<Utc>,
}

impl DirEntry {
    /// A file entry.
    pub fn file(
        name: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        mod_time: DateTime<Utc>,
    ) -> Self {
        Self {
            is_dir: false,
            name: name.into(),
            path: path.into(),
            size,
            mod_time,
        }
    }

    /// A directory entry. Directories report size zero.
    pub fn dir(name: impl Into<String>, path: impl Into<String>, mod_time: DateTime<Utc>) -> Self {
        Self {
            is_dir: true,
            name: name.into(),
            path: path.into(),
            size: 0,
            mod_time,
        }
    }

    /// Whether this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Leaf name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full logical path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Size in bytes; zero for directories.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Last modification time.
    pub fn mod_time(&self) -> DateTime<Utc> {
        self.mod_time
    }

    /// The same entry presented under a different path.
    pub fn relocated(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    /// The same entry with a new name, path and size.
    pub fn renamed(&self, name: impl Into<String>, path: impl Into<String>, size: u64) -> Self {
        Self {
            is_dir: self.is_dir,
            name: name.into(),
            path: path.into(),
            size,
            mod_time: self.mod_time,
        }
    }
}

/// Options controlling a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Only yield directories.
    pub dirs_only: bool,
    /// Only yield files.
    pub files_only: bool,
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Maximum depth when recursive; `None` is unlimited, `Some(1)` is the
    /// immediate children only.
    pub max_depth: Option<usize>,
    /// The caller knows the path names a file, so directory probing is skipped.
    pub path_is_file: bool,
}

impl ListOptions {
    /// Unlimited recursive listing.
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }

    /// Listing of a path known to be a file.
    pub fn file() -> Self {
        Self {
            path_is_file: true,
            ..Self::default()
        }
    }

    /// Depth limit to apply while walking, where 1 means immediate children.
    pub fn effective_depth(&self) -> Option<usize> {
        if self.recursive {
            self.max_depth
        } else {
            Some(1)
        }
    }

    /// Whether an entry passes the `dirs_only`/`files_only` filters.
    pub fn accepts(&self, entry: &DirEntry) -> bool {
        if entry.is_dir() {
            !self.files_only
        } else {
            !self.dirs_only
        }
    }
}

/// Aggregate of a recursive listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatResult {
    /// Sum of file sizes.
    pub total_size: u64,
    /// Number of entries, directories plus files.
    pub entries: u64,
    /// Number of directories.
    pub dirs: u64,
    /// Number of files.
    pub files: u64,
}

impl StatResult {
    /// The result of stat on a single file.
    pub fn single_file(size: u64) -> Self {
        Self {
            total_size: size,
            entries: 1,
            dirs: 0,
            files: 1,
        }
    }

    /// Accounts for one more entry.
    pub fn record(&mut self, entry: &DirEntry) {
        if entry.is_dir() {
            self.dirs += 1;
        } else {
            self.files += 1;
            self.total_size += entry.size();
        }
        self.entries = self.dirs + self.files;
    }
}

/// The input of a push: a byte stream plus its length when known up front.
pub struct Source {
    reader: ByteStream,
    len: Option<u64>,
}

impl Source {
    /// A source with an explicit (possibly unknown) length.
    pub fn new(reader: ByteStream, len: Option<u64>) -> Self {
        Self { reader, len }
    }

    /// A source of unknown length.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::new(Box::new(reader), None)
    }

    /// An in-memory source.
    pub fn from_bytes(data: impl Into<bytes::Bytes>) -> Self {
        let data: bytes::Bytes = data.into();
        let len = data.len() as u64;
        Self::new(Box::new(std::io::Cursor::new(data)), Some(len))
    }

    /// Opens a local file; regular files carry their length so backends can
    /// take a length-aware upload path.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Self::from_file(file).await
    }

    /// Wraps an open file.
    pub async fn from_file(file: tokio::fs::File) -> std::io::Result<Self> {
        let meta = file.metadata().await?;
        let len = meta.is_file().then(|| meta.len());
        Ok(Self::new(Box::new(file), len))
    }

    /// Length in bytes, if known.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// True if the length is known to be zero.
    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }

    /// Consumes the source, returning the reader.
    pub fn into_reader(self) -> ByteStream {
        self.reader
    }

    /// Consumes the source, returning reader and length.
    pub fn into_parts(self) -> (ByteStream, Option<u64>) {
        (self.reader, self.len)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("len", &self.len).finish_non_exhaustive()
    }
}

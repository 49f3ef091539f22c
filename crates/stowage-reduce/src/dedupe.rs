//! Content-defined chunking (FastCDC) and the content index used for deduplication

use crate::fingerprint::{blake3_hash, ChunkHash};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use fastcdc::v2020::FastCDC;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::io::{AsyncRead, AsyncReadExt};

/// A content-defined chunk produced by the FastCDC chunker
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Chunk content
    pub data: Bytes,
    /// BLAKE3 hash of the chunk content (CAS key)
    pub hash: ChunkHash,
    /// Byte offset of this chunk in the original data stream
    pub offset: u64,
}

/// Configuration for the FastCDC chunker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Minimum chunk size in bytes
    pub min_size: usize,
    /// Average (target) chunk size in bytes
    pub avg_size: usize,
    /// Maximum chunk size in bytes
    pub max_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 128 * 1024,
            avg_size: 512 * 1024,
            max_size: 2 * 1024 * 1024,
        }
    }
}

/// Content-defined chunker using the FastCDC algorithm
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Create a chunker with default sizes
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chunker with custom configuration
    pub fn with_config(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Sizes this chunker cuts with
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    fn cdc<'a>(&self, data: &'a [u8]) -> FastCDC<'a> {
        FastCDC::new(
            data,
            self.config.min_size as u32,
            self.config.avg_size as u32,
            self.config.max_size as u32,
        )
    }

    /// Chunk data using FastCDC and compute BLAKE3 hash per chunk.
    /// Concatenating all chunk.data bytes reconstructs the original data.
    pub fn chunk(&self, data: &[u8]) -> Vec<Chunk> {
        if data.is_empty() {
            return Vec::new();
        }
        self.cdc(data)
            .map(|c| {
                let chunk_bytes = Bytes::copy_from_slice(&data[c.offset..c.offset + c.length]);
                Chunk {
                    hash: blake3_hash(&chunk_bytes),
                    data: chunk_bytes,
                    offset: c.offset as u64,
                }
            })
            .collect()
    }

    /// Chunk an async stream, holding at most `max_size` bytes at a time.
    pub fn stream<R: AsyncRead + Unpin>(&self, reader: R) -> StreamChunker<R> {
        StreamChunker {
            chunker: self.clone(),
            reader,
            buf: BytesMut::new(),
            offset: 0,
            eof: false,
        }
    }
}

/// Incremental chunker over an `AsyncRead`. Cut points match [`Chunker::chunk`]
/// over the same bytes.
pub struct StreamChunker<R> {
    chunker: Chunker,
    reader: R,
    buf: BytesMut,
    offset: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StreamChunker<R> {
    /// Next chunk, or `None` once the stream is exhausted
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
        let max = self.chunker.config.max_size;
        while !self.eof && self.buf.len() < max {
            self.buf.reserve(max - self.buf.len());
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
        if self.buf.is_empty() {
            return Ok(None);
        }
        let cut = self
            .chunker
            .cdc(&self.buf)
            .next()
            .map(|c| c.length)
            .unwrap_or(self.buf.len());
        let data = self.buf.split_to(cut).freeze();
        let chunk = Chunk {
            hash: blake3_hash(&data),
            offset: self.offset,
            data,
        };
        self.offset += cut as u64;
        Ok(Some(chunk))
    }

    /// Bytes consumed into chunks so far
    pub fn position(&self) -> u64 {
        self.offset
    }
}

/// What the index knows about one stored chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Plaintext length
    pub original_size: u64,
    /// Length of the stored envelope
    pub stored_size: u64,
    /// When the chunk blob was written
    pub written_at: DateTime<Utc>,
}

/// Chunks added by one write session, persisted as `indexes/<id>`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexDelta {
    /// New chunk entries, keyed by hex hash
    pub chunks: BTreeMap<String, ChunkInfo>,
}

impl IndexDelta {
    /// Record a chunk
    pub fn insert(&mut self, hash: ChunkHash, info: ChunkInfo) {
        self.chunks.insert(hash.to_hex(), info);
    }

    /// True if the delta already holds this chunk
    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.chunks.contains_key(&hash.to_hex())
    }

    /// Number of chunks in the delta
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// In-memory content index: which chunks the repository already stores.
#[derive(Debug, Default, Clone)]
pub struct ContentIndex {
    entries: HashMap<ChunkHash, ChunkInfo>,
}

impl ContentIndex {
    /// Create a new empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this hash already exists (it's a duplicate)
    pub fn lookup(&self, hash: &ChunkHash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Entry for a hash
    pub fn get(&self, hash: &ChunkHash) -> Option<&ChunkInfo> {
        self.entries.get(hash)
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, hash: ChunkHash, info: ChunkInfo) {
        self.entries.insert(hash, info);
    }

    /// Fold a persisted delta in. Entries with malformed hashes are skipped.
    pub fn merge(&mut self, delta: &IndexDelta) {
        for (hex, info) in &delta.chunks {
            if let Some(hash) = ChunkHash::from_hex(hex) {
                self.entries.insert(hash, *info);
            }
        }
    }

    /// Drop every entry whose hash is not in `keep`. Returns the number removed.
    pub fn retain(&mut self, keep: &HashSet<ChunkHash>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|h, _| keep.contains(h));
        before - self.entries.len()
    }

    /// Remove one entry
    pub fn remove(&mut self, hash: &ChunkHash) -> Option<ChunkInfo> {
        self.entries.remove(hash)
    }

    /// Snapshot of the whole index as one delta
    pub fn to_delta(&self) -> IndexDelta {
        let mut delta = IndexDelta::default();
        for (hash, info) in &self.entries {
            delta.insert(*hash, *info);
        }
        delta
    }

    /// Number of unique chunks tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of stored envelope sizes
    pub fn stored_bytes(&self) -> u64 {
        self.entries.values().map(|i| i.stored_size).sum()
    }
}

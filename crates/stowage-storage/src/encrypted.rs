//! Transparent stream encryption layer.
//!
//! Each logical object `x` is stored as ciphertext under `x.~enc`. Listings
//! drop the suffix and report plaintext sizes; objects without the suffix are
//! not part of this namespace and are skipped.
//!
//! Encryption and decryption run concurrently with the inner transfer,
//! connected by a bounded [`pipe`](crate::pipe). When both sides fail, the
//! error that caused the other one wins: an I/O failure triggered by the
//! transform aborting the pipe is reported as the transform error.

use std::any::Any;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::encryption::{EncryptionError, StreamEncryptor};
use crate::error::{ErrorKind, StorageError, StorageResult, StorageResultExt};
use crate::path;
use crate::pipe::{self, DEFAULT_PIPE_DEPTH};
use crate::sanitized::SanitizedStorage;
use crate::skip::SkipReader;
use crate::storage::{stat_by_listing, ListCallback, Storage};
use crate::types::{ByteStream, DirEntry, ListOptions, Sink, Source, StatResult};

/// Suffix appended to every ciphertext object.
pub const ENCRYPTED_SUFFIX: &str = ".~enc";

/// Encrypts everything written to the inner storage.
pub struct EncryptedStorage {
    encryptor: Arc<dyn StreamEncryptor>,
    inner: Arc<dyn Storage>,
    pipe_depth: usize,
}

impl EncryptedStorage {
    /// Wraps `inner` with `encryptor`.
    pub fn new(encryptor: Arc<dyn StreamEncryptor>, inner: Arc<dyn Storage>) -> Self {
        debug!(algorithm = encryptor.algorithm(), inner = inner.layer_name(), "encrypted layer");
        Self {
            encryptor,
            inner,
            pipe_depth: DEFAULT_PIPE_DEPTH,
        }
    }

    /// Overrides the number of chunks buffered between the two tasks.
    pub fn with_pipe_depth(mut self, depth: usize) -> Self {
        self.pipe_depth = depth.max(1);
        self
    }

    /// The layer as a stack element, with path cleaning in front of it.
    pub fn wrap(
        encryptor: Arc<dyn StreamEncryptor>,
        inner: Arc<dyn Storage>,
    ) -> StorageResult<Arc<dyn Storage>> {
        SanitizedStorage::wrap("", Arc::new(Self::new(encryptor, inner)))
    }

    /// The encryptor in use.
    pub fn encryptor(&self) -> &Arc<dyn StreamEncryptor> {
        &self.encryptor
    }

    fn cipher_path(path: &str) -> String {
        format!("{path}{ENCRYPTED_SUFFIX}")
    }

    fn translate(&self, entry: DirEntry) -> Option<DirEntry> {
        if entry.is_dir() {
            return Some(entry);
        }
        let name = entry.name().strip_suffix(ENCRYPTED_SUFFIX)?;
        let entry_path = entry.path().strip_suffix(ENCRYPTED_SUFFIX)?;
        let size = entry.size().saturating_sub(self.encryptor.overhead());
        Some(entry.renamed(name, entry_path, size))
    }
}

fn reject_reserved(path: &str) -> StorageResult<()> {
    match path::segment_ending_with(path, ENCRYPTED_SUFFIX) {
        Some(segment) => Err(StorageError::invalid_path(
            path,
            format!("{segment:?}: names ending in {ENCRYPTED_SUFFIX} are reserved"),
        )),
        None => Ok(()),
    }
}

fn transform_error(err: EncryptionError) -> StorageError {
    StorageError::Transform(err.to_string())
}

/// Outcome of one side of a piped transfer and whether its failure was only a
/// consequence of the other side aborting the pipe.
struct Side<T> {
    result: T,
    consequence: bool,
}

/// Picks the error to report from the transfer side and the transform side.
fn settle(
    transfer: Side<StorageResult<()>>,
    transform: Side<Result<(), EncryptionError>>,
) -> StorageResult<()> {
    match (transfer.result, transform.result) {
        (Ok(()), Ok(())) => Ok(()),
        (_, Err(err)) if !transform.consequence => Err(transform_error(err)),
        (Err(err), _) => Err(err),
        (Ok(()), Err(err)) => Err(transform_error(err)),
    }
}

#[async_trait]
impl Storage for EncryptedStorage {
    async fn push(&self, source: Source, path: &str) -> StorageResult<()> {
        reject_reserved(path)?;
        let (mut plain, len) = source.into_parts();
        let cipher_len = len.map(|n| n + self.encryptor.overhead());
        let (mut tx, rx) = pipe::channel(self.pipe_depth);
        let encryptor = Arc::clone(&self.encryptor);
        let task = tokio::spawn(async move {
            let mut result = encryptor.encrypt_stream(&mut plain, &mut tx).await;
            if result.is_ok() {
                result = tx.finish().await.map_err(|source| EncryptionError::Write {
                    what: "ciphertext",
                    source,
                });
            }
            let consequence = match &result {
                Ok(()) => false,
                Err(err) => {
                    let consumer_gone = tx.receiver_gone();
                    if !consumer_gone {
                        tx.fail(io::Error::other(err.to_string())).await;
                    }
                    consumer_gone
                }
            };
            Side { result, consequence }
        });

        let pushed = self
            .inner
            .push(Source::new(Box::new(rx), cipher_len), &Self::cipher_path(path))
            .await;
        let encrypted = task
            .await
            .map_err(|err| StorageError::Transform(format!("encryption task failed: {err}")))?;
        let transfer = Side {
            consequence: pushed.is_err() && encrypted.result.is_err() && !encrypted.consequence,
            result: pushed,
        };
        settle(transfer, encrypted).with_context(|| format!("encrypted push {path}"))
    }

    async fn pull(&self, path: &str, sink: &mut Sink<'_>) -> StorageResult<()> {
        reject_reserved(path)?;
        let (mut tx, mut rx) = pipe::channel(self.pipe_depth);
        let cipher_path = Self::cipher_path(path);

        let fetch = async {
            let mut result = self.inner.pull(&cipher_path, &mut tx).await;
            if result.is_ok() {
                result = tx.finish().await.map_err(StorageError::from_io);
            }
            let consequence = match &result {
                Ok(()) => false,
                Err(err) => {
                    let decrypt_gone = tx.receiver_gone();
                    if !decrypt_gone {
                        tx.fail(io::Error::other(err.to_string())).await;
                    }
                    decrypt_gone
                }
            };
            Side { result, consequence }
        };
        let decrypt = async {
            let result = self.encryptor.decrypt_stream(&mut rx, sink).await;
            let consequence = result.is_err() && rx.upstream_failed();
            if result.is_err() {
                rx.close();
            }
            Side { result, consequence }
        };

        let (fetched, decrypted) = tokio::join!(fetch, decrypt);
        settle(fetched, decrypted).with_context(|| format!("encrypted pull {path}"))
    }

    async fn open(&self, path: &str, offset: u64, length: Option<u64>) -> StorageResult<ByteStream> {
        reject_reserved(path)?;
        let mut cipher = self
            .inner
            .open(&Self::cipher_path(path), 0, None)
            .await
            .with_context(|| format!("encrypted open {path}"))?;
        let (mut tx, rx) = pipe::channel(self.pipe_depth);
        let encryptor = Arc::clone(&self.encryptor);
        let object = path.to_string();
        tokio::spawn(async move {
            let mut result = encryptor
                .decrypt_stream(&mut cipher, &mut tx)
                .await
                .map_err(|err| io::Error::other(err.to_string()));
            if result.is_ok() {
                result = tx.finish().await;
            }
            if let Err(err) = result {
                if tx.receiver_gone() {
                    debug!(path = %object, "reader closed before decryption finished");
                } else {
                    tx.fail(err).await;
                }
            }
        });

        let mut reader: ByteStream = Box::new(rx);
        if offset > 0 {
            warn!(
                path,
                offset, "ranged read through encryption decrypts and discards the leading bytes"
            );
            reader = Box::new(SkipReader::new(reader, offset));
        }
        if let Some(length) = length {
            reader = Box::new(reader.take(length));
        }
        Ok(reader)
    }

    async fn remove(&self, path: &str, recursive: bool) -> StorageResult<()> {
        if recursive {
            return self.inner.remove(path, true).await;
        }
        self.inner.remove(&Self::cipher_path(path), false).await
    }

    async fn mkdir(&self, path: &str) -> StorageResult<()> {
        reject_reserved(path)?;
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
        let mut translate = |entry: DirEntry| match self.translate(entry) {
            Some(entry) => callback(entry),
            None => Ok(()),
        };

        if opts.path_is_file {
            return self
                .inner
                .list_with(&Self::cipher_path(path), opts, &mut translate)
                .await;
        }
        if !path::has_dir_marker(path) && !path::is_root(path) {
            let single = ListOptions {
                path_is_file: true,
                ..opts.clone()
            };
            match self
                .inner
                .list_with(&Self::cipher_path(path), &single, &mut translate)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::ObjectNotFound => {}
                Err(err) => return Err(err),
            }
        }
        self.inner.list_with(path, opts, &mut translate).await
    }

    async fn stat(&self, path: &str) -> StorageResult<StatResult> {
        stat_by_listing(self, path).await
    }

    fn inner(&self) -> Option<&Arc<dyn Storage>> {
        Some(&self.inner)
    }

    fn layer_name(&self) -> &'static str {
        "encrypted"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStorage;
    use crate::encryption::{create_encryptor, DEFAULT_ALGORITHM, IV_LEN};
    use crate::memory::MemoryBackend;
    use tokio::io::AsyncWrite;

    fn stack() -> (Arc<BackendStorage<MemoryBackend>>, EncryptedStorage) {
        let backend = Arc::new(BackendStorage::new(MemoryBackend::new()));
        let encryptor = create_encryptor(DEFAULT_ALGORITHM, b"passphrase").unwrap();
        let layer = EncryptedStorage::new(encryptor, backend.clone() as Arc<dyn Storage>);
        (backend, layer)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_push_stores_ciphertext_under_suffix() {
        let (backend, enc) = stack();
        let data = payload(1000);
        enc.push(Source::from_bytes(data.clone()), "dir/file").await.unwrap();
        let stored = backend.backend().object("dir/file.~enc").unwrap();
        assert_eq!(stored.len(), 1000 + IV_LEN);
        assert_ne!(&stored[IV_LEN..], &data[..]);
        assert_eq!(backend.backend().stats().sized_puts, 1);
    }

    #[tokio::test]
    async fn test_pull_round_trip_large() {
        let (_backend, enc) = stack();
        let data = payload(3 * 1024 * 1024 + 17);
        enc.push(Source::stream(std::io::Cursor::new(data.clone())), "big")
            .await
            .unwrap();
        let mut out = Vec::new();
        enc.pull("big", &mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_pull_missing_keeps_sentinel() {
        let (_backend, enc) = stack();
        let mut out = Vec::new();
        let err = enc.pull("nope", &mut out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);
    }

    #[tokio::test]
    async fn test_open_with_offset_and_length() {
        let (_backend, enc) = stack();
        let data = payload(500_000);
        enc.push(Source::from_bytes(data.clone()), "r").await.unwrap();
        let mut reader = enc.open("r", 200_000, Some(1234)).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[200_000..201_234]);

        let mut tail = enc.open("r", 499_990, None).await.unwrap();
        let mut out = Vec::new();
        tail.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[499_990..]);
    }

    #[tokio::test]
    async fn test_dropping_open_reader_stops_decryption() {
        let (_backend, enc) = stack();
        enc.push(Source::from_bytes(payload(2_000_000)), "r").await.unwrap();
        let mut reader = enc.open("r", 0, None).await.unwrap();
        let mut first = [0u8; 10];
        reader.read_exact(&mut first).await.unwrap();
        drop(reader);
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_listing_hides_suffix_and_overhead() {
        let (backend, enc) = stack();
        enc.push(Source::from_bytes(payload(100)), "d/a").await.unwrap();
        enc.push(Source::from_bytes(payload(50)), "d/sub/b").await.unwrap();
        backend
            .push(Source::from_bytes(&b"stray"[..]), "d/plain.txt")
            .await
            .unwrap();

        let mut entries = enc.list("d/", &ListOptions::recursive()).await.unwrap();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        let view: Vec<_> = entries
            .iter()
            .map(|e| (e.path().to_string(), e.size(), e.is_dir()))
            .collect();
        assert_eq!(
            view,
            vec![
                ("d/a".to_string(), 100, false),
                ("d/sub".to_string(), 0, true),
                ("d/sub/b".to_string(), 50, false),
            ]
        );

        let single = enc.list("d/a", &ListOptions::default()).await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].name(), "a");

        let stat = enc.stat("d/").await.unwrap();
        assert_eq!((stat.files, stat.dirs, stat.total_size), (2, 1, 150));
    }

    #[tokio::test]
    async fn test_reserved_suffix_rejected() {
        let (_backend, enc) = stack();
        let err = enc
            .push(Source::from_bytes(&b"x"[..]), "sneaky.~enc")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }

    #[tokio::test]
    async fn test_reserved_suffix_rejected_in_directory_segment() {
        let (_backend, enc) = stack();
        enc.push(Source::from_bytes(&b"x"[..]), "a").await.unwrap();
        let err = enc
            .push(Source::from_bytes(&b"y"[..]), "a.~enc/f")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        let mut sink = Vec::new();
        let err = enc.pull("a.~enc/f", &mut sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(enc.mkdir("d.~enc").await.unwrap_err().kind(), ErrorKind::InvalidPath);

        let listed = enc.list("", &ListOptions::recursive()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!((listed[0].path(), listed[0].size()), ("a", 1));
    }

    #[tokio::test]
    async fn test_remove_single_and_recursive() {
        let (backend, enc) = stack();
        enc.push(Source::from_bytes(payload(10)), "t/a").await.unwrap();
        enc.push(Source::from_bytes(payload(10)), "t/b").await.unwrap();
        enc.remove("t/a", false).await.unwrap();
        assert!(backend.backend().object("t/a.~enc").is_none());
        enc.remove("t", true).await.unwrap();
        assert_eq!(backend.backend().object_count(), 0);
    }

    struct FailingSink;

    impl AsyncWrite for FailingSink {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported_as_transform_error() {
        let (_backend, enc) = stack();
        enc.push(Source::from_bytes(payload(1_000_000)), "f").await.unwrap();
        let mut sink = FailingSink;
        let err = enc.pull("f", &mut sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transform);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_settle_prefers_root_cause() {
        let io_consequence = Side {
            result: Err(StorageError::Io(io::Error::other("broken pipe"))),
            consequence: true,
        };
        let transform_root = Side {
            result: Err(EncryptionError::MissingIv),
            consequence: false,
        };
        assert_eq!(settle(io_consequence, transform_root).unwrap_err().kind(), ErrorKind::Transform);

        let io_root = Side {
            result: Err(StorageError::not_found("x")),
            consequence: false,
        };
        let transform_consequence = Side {
            result: Err(EncryptionError::MissingIv),
            consequence: true,
        };
        assert_eq!(
            settle(io_root, transform_consequence).unwrap_err().kind(),
            ErrorKind::ObjectNotFound
        );
    }
}

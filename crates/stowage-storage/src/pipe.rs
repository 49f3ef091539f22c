//! Bounded in-memory byte pipe connecting two concurrent tasks.
//!
//! The writer half is an `AsyncWrite`, the reader half an `AsyncRead`; bytes
//! travel as chunks over a bounded `mpsc` channel, so a fast producer blocks
//! once `depth` chunks are queued. End of stream is an explicit frame: a
//! writer dropped without [`PipeWriter::finish`] surfaces on the reader as an
//! unexpected EOF rather than a silently truncated stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Default number of chunks in flight.
pub const DEFAULT_PIPE_DEPTH: usize = 4;

/// Largest chunk carried by one frame.
const MAX_CHUNK: usize = 128 * 1024;

enum Frame {
    Data(Bytes),
    Eof,
    Failed(io::Error),
}

/// Creates a pipe holding at most `depth` chunks.
pub fn channel(depth: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        PipeWriter {
            tx: PollSender::new(tx),
            finished: false,
        },
        PipeReader {
            rx,
            pending: Bytes::new(),
            upstream_failed: false,
            done: false,
        },
    )
}

/// Producing end of a pipe.
pub struct PipeWriter {
    tx: PollSender<Frame>,
    finished: bool,
}

impl PipeWriter {
    /// Signals end of stream to the reader.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.shutdown().await
    }

    /// Delivers `err` to the reader, if it is still listening, and closes the pipe.
    pub async fn fail(&mut self, err: io::Error) {
        if !self.finished {
            if let Some(sender) = self.tx.get_ref() {
                let _ = sender.send(Frame::Failed(err)).await;
            }
            self.finished = true;
        }
        self.tx.close();
    }

    /// True once the reader has gone away; anything written after that is lost.
    pub fn receiver_gone(&self) -> bool {
        self.tx.get_ref().map_or(true, |sender| sender.is_closed())
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed")
}

impl AsyncWrite for PipeWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Err(closed_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed_pipe()));
        }
        let len = buf.len().min(MAX_CHUNK);
        this.tx
            .send_item(Frame::Data(Bytes::copy_from_slice(&buf[..len])))
            .map_err(|_| closed_pipe())?;
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(closed_pipe()));
        }
        this.tx.send_item(Frame::Eof).map_err(|_| closed_pipe())?;
        this.finished = true;
        this.tx.close();
        Poll::Ready(Ok(()))
    }
}

/// Consuming end of a pipe.
pub struct PipeReader {
    rx: mpsc::Receiver<Frame>,
    pending: Bytes,
    upstream_failed: bool,
    done: bool,
}

impl PipeReader {
    /// True if the writer ended the stream with an error, or vanished without finishing.
    pub fn upstream_failed(&self) -> bool {
        self.upstream_failed
    }

    /// Stops accepting data; the writer's next write fails.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Frame::Data(chunk)) => this.pending = chunk,
                Some(Frame::Eof) => {
                    this.done = true;
                    this.rx.close();
                }
                Some(Frame::Failed(err)) => {
                    this.upstream_failed = true;
                    this.done = true;
                    this.rx.close();
                    return Poll::Ready(Err(err));
                }
                None => {
                    this.upstream_failed = true;
                    this.done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe writer dropped before end of stream",
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_transfers_bytes_in_order() {
        let (mut tx, mut rx) = channel(2);
        let producer = tokio::spawn(async move {
            for i in 0..100u8 {
                tx.write_all(&[i; 1000]).await.unwrap();
            }
            tx.finish().await.unwrap();
        });
        let mut out = Vec::new();
        rx.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();
        assert_eq!(out.len(), 100_000);
        assert!(out.chunks(1000).enumerate().all(|(i, c)| c.iter().all(|b| *b as usize == i)));
        assert!(!rx.upstream_failed());
    }

    #[tokio::test]
    async fn test_error_reaches_reader() {
        let (mut tx, mut rx) = channel(2);
        tx.write_all(b"partial").await.unwrap();
        tx.fail(io::Error::new(io::ErrorKind::InvalidData, "boom")).await;
        let mut out = Vec::new();
        let err = rx.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(out, b"partial");
        assert!(rx.upstream_failed());
    }

    #[tokio::test]
    async fn test_dropped_writer_is_not_eof() {
        let (mut tx, mut rx) = channel(2);
        tx.write_all(b"abc").await.unwrap();
        drop(tx);
        let mut out = Vec::new();
        let err = rx.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(rx.upstream_failed());
    }

    #[tokio::test]
    async fn test_closed_reader_unblocks_writer() {
        let (mut tx, mut rx) = channel(1);
        tx.write_all(b"fill").await.unwrap();
        rx.close();
        let err = tx.write_all(b"more").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(tx.receiver_gone());
    }

    #[tokio::test]
    async fn test_back_pressure_bounds_queue() {
        let (mut tx, _rx) = channel(2);
        tx.write_all(b"1").await.unwrap();
        tx.write_all(b"2").await.unwrap();
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), tx.write_all(b"3")).await;
        assert!(third.is_err(), "third write should block on a full pipe");
    }
}

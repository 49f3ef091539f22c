//! Reader adaptor that discards a fixed number of leading bytes.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

const SCRATCH_LEN: usize = 64 * 1024;

/// Discards the first `skip` bytes of `inner`, then reads through.
pub struct SkipReader<R> {
    inner: R,
    remaining: u64,
    scratch: Box<[u8]>,
}

impl<R> SkipReader<R> {
    /// Skips `skip` bytes of `inner`.
    pub fn new(inner: R, skip: u64) -> Self {
        let scratch_len = skip.min(SCRATCH_LEN as u64) as usize;
        Self {
            inner,
            remaining: skip,
            scratch: vec![0u8; scratch_len].into_boxed_slice(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SkipReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.remaining > 0 {
            let want = this.remaining.min(this.scratch.len() as u64) as usize;
            let mut discard = ReadBuf::new(&mut this.scratch[..want]);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut discard))?;
            let n = discard.filled().len();
            if n == 0 {
                this.remaining = 0;
                return Poll::Ready(Ok(()));
            }
            this.remaining -= n as u64;
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_skips_prefix() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        let mut reader = SkipReader::new(&data[..], 100_000);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, &data[100_000..]);
    }

    #[tokio::test]
    async fn test_skip_past_end_is_empty() {
        let mut reader = SkipReader::new(&b"short"[..], 10);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_zero_skip_reads_through() {
        let mut reader = SkipReader::new(&b"abc"[..], 0);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "abc");
    }
}

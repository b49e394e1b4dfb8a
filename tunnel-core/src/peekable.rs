//! Component A: a peekable wrapper over any async byte stream.
//!
//! `peek(n)` never consumes: repeated calls return the same prefix, and a
//! subsequent `read` sees those bytes first. Grounded in the teacher's own
//! `io.read_buf` + classify-then-forward pattern in
//! `router-core/src/app/proxy.rs::process_new` (which reads an initial
//! buffer, classifies it, then replays it to the upstream) generalized into
//! a reusable wrapper instead of a one-off `process_new` local.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{timeout, Duration};

pub struct PeekableStream<T> {
    inner: T,
    /// Bytes already pulled off the wire but not yet delivered to a `read`.
    peeked: Vec<u8>,
    /// How much of `peeked` has already been handed to `read`.
    consumed: usize,
    read_deadline: Option<Duration>,
}

impl<T> PeekableStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            peeked: Vec::new(),
            consumed: 0,
            read_deadline: None,
        }
    }

    pub fn set_read_deadline(&mut self, d: Option<Duration>) {
        self.read_deadline = d;
    }

    /// True once all previously peeked bytes have been consumed by `read` —
    /// at that point callers may bypass this wrapper and read the raw
    /// handle directly (the splice fast path in the copy engine).
    pub fn reader_replaceable(&self) -> bool {
        self.consumed >= self.peeked.len()
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Peek at least `n` bytes without consuming them. Returns fewer than
    /// `n` only on EOF.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.peeked.len() - self.consumed < n {
            let mut chunk = vec![0u8; n - (self.peeked.len() - self.consumed)];
            let read = self.raw_read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            self.peeked.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.peeked[self.consumed..])
    }

    async fn raw_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        let fut = self.inner.read(buf);
        match self.read_deadline {
            Some(d) => timeout(d, fut)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peek timeout"))?,
            None => fut.await,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.consumed < self.peeked.len() {
            let available = &self.peeked[self.consumed..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.consumed += n;
            if self.reader_replaceable() {
                self.peeked.clear();
                self.consumed = 0;
            }
            return Ok(n);
        }
        self.raw_read(buf).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use tokio::io::AsyncWriteExt;
        self.inner.write(buf).await
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.inner.write_all(buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.inner.flush().await
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PeekableStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.consumed < this.peeked.len() {
            let available = &this.peeked[this.consumed..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.consumed += n;
            if this.reader_replaceable() {
                this.peeked.clear();
                this.consumed = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PeekableStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn peek_is_idempotent_and_read_sees_same_bytes() {
        let (mut client, server) = duplex(64);
        client.write_all(b"hello world").await.unwrap();

        let mut p = PeekableStream::new(server);
        let first = p.peek(5).await.unwrap().to_vec();
        let second = p.peek(5).await.unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(&first, b"hello");

        let mut buf = [0u8; 5];
        let n = p.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        let mut rest = [0u8; 6];
        let n = p.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b" world");
    }

    #[tokio::test]
    async fn reader_replaceable_after_full_drain() {
        let (mut client, server) = duplex(64);
        client.write_all(b"ab").await.unwrap();
        let mut p = PeekableStream::new(server);
        p.peek(2).await.unwrap();
        assert!(!p.reader_replaceable());
        let mut buf = [0u8; 2];
        p.read(&mut buf).await.unwrap();
        assert!(p.reader_replaceable());
    }
}

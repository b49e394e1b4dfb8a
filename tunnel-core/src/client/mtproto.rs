use async_trait::async_trait;
use ctr::cipher::StreamCipher;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::{BoxedStream, ClientImpl, DialArgs};
use crate::mtproto_protocol::{client_handshake_frame, CtrCipher, ConnType};
use crate::proxy_dialer::ProxyDialer;

/// Outbound MTProto transport: dial a remote obfuscated2 endpoint (our own
/// tunnel's remote side, not a foreign Telegram proxy) and present it as a
/// plain byte stream, encrypting/decrypting transparently.
pub struct MtprotoClientImpl {
    target_address: String,
    proxy: ProxyDialer,
    dc_id: i16,
}

impl MtprotoClientImpl {
    pub fn new(target_address: String, proxy: &str, dc_id: i16) -> Self {
        Self {
            target_address,
            proxy: ProxyDialer::parse(proxy),
            dc_id,
        }
    }
}

#[async_trait]
impl ClientImpl for MtprotoClientImpl {
    async fn dial(&self, args: DialArgs) -> io::Result<BoxedStream> {
        let mut tcp = self.proxy.connect(&self.target_address).await?;
        let (frame, encrypt_keys, decrypt_keys) =
            client_handshake_frame(ConnType::Intermediate, self.dc_id);
        tcp.write_all(&frame).await?;

        let mut stream = MtprotoByteStream {
            inner: tcp,
            encrypt: encrypt_keys.cipher(),
            decrypt: decrypt_keys.cipher(),
            write_pending: Vec::new(),
            write_pos: 0,
        };
        if !args.early_data.is_empty() {
            stream.write_all(&args.early_data).await?;
        }
        Ok(Box::pin(stream))
    }

    fn target(&self) -> &str {
        &self.target_address
    }

    fn proxy(&self) -> &str {
        self.proxy.raw()
    }
}

/// `AsyncRead`/`AsyncWrite` over a raw TCP socket with AES-CTR applied in
/// both directions. Reads decrypt in place after the inner read completes.
/// Writes are buffered one encrypted chunk at a time: a chunk is only
/// encrypted once (at accept time) and retried as-is until the socket has
/// taken every byte, so the keystream never desyncs from a short write.
struct MtprotoByteStream {
    inner: TcpStream,
    encrypt: CtrCipher,
    decrypt: CtrCipher,
    write_pending: Vec<u8>,
    write_pos: usize,
}

impl MtprotoByteStream {
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_pending.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.write_pending[self.write_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "write zero")))
                }
                Poll::Ready(Ok(n)) => self.write_pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.write_pending.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for MtprotoByteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.decrypt.apply_keystream(&mut buf.filled_mut()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for MtprotoByteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let chunk_len = buf.len().min(64 * 1024);
        let mut chunk = buf[..chunk_len].to_vec();
        this.encrypt.apply_keystream(&mut chunk);
        this.write_pending = chunk;
        this.write_pos = 0;

        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(chunk_len)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            // Nothing of this chunk reached the socket yet; it stays staged
            // in write_pending (already encrypted, so a retry won't re-apply
            // the keystream) and the next poll_write drains it before
            // touching any new bytes.
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

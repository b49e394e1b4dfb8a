//! Component H: server-side HTTP/WS multiplexer.
//!
//! One listener can serve several `target-address`/`ws-path` pairs (the
//! `server.target` list, see `ServerTargetConfig`), the same vhost-by-path
//! dispatch the original's `server/server.go` does with its `http.ServeMux`.
//! An incoming upgrade is parsed by hand (`ws::parse_upgrade_request`, same
//! as the fallback path's own classifiers) so early data riding in
//! `Sec-WebSocket-Protocol` can be decoded and written to the target before
//! the main copy loop starts, and the v2ray "http-upgrade" raw variant skips
//! WS framing entirely.

use futures_util::{Sink, Stream};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_tungstenite::tungstenite::{protocol::Role, Message};
use tokio_tungstenite::WebSocketStream;

use crate::buffer_pool::BufferPool;
use crate::client::{BoxedStream, ClientImpl, DialArgs};
use crate::config::ServerTargetConfig;
use crate::copy::{tunnel_generic, ConnType};
use crate::early_data;
use crate::peekable::PeekableStream;
use crate::proxy_dialer::ProxyDialer;
use crate::ws;

enum TargetKind {
    Tcp { target_address: String, proxy: ProxyDialer },
    /// The registry's own short-circuit: a local client's `server-ws-path`
    /// wires its `ClientImpl` straight into this mux entry, so a request on
    /// this path never opens a real TCP socket to reach it.
    InProcess { client_impl: Arc<dyn ClientImpl> },
}

struct Target {
    path: String,
    kind: TargetKind,
}

pub struct HttpMux {
    targets: Vec<Target>,
}

impl HttpMux {
    pub fn from_config(targets: &[ServerTargetConfig]) -> Self {
        Self {
            targets: targets
                .iter()
                .map(|t| Target {
                    path: t.ws_path.clone(),
                    kind: TargetKind::Tcp {
                        target_address: t.target_address.clone(),
                        proxy: ProxyDialer::parse(&t.proxy.proxy),
                    },
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Register an in-process route for a local client's `server-ws-path`,
    /// wiring requests on `path` directly to `client_impl` rather than
    /// through `target[]`'s TCP dialer.
    pub fn register_in_process(&mut self, path: String, client_impl: Arc<dyn ClientImpl>) {
        self.targets.push(Target { path, kind: TargetKind::InProcess { client_impl } });
    }

    fn find(&self, path: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.path == path)
    }

    /// Handle a connection whose peeked prefix has already been confirmed to
    /// look like an HTTP GET (see `fallback.rs`'s `FallbackOutcome::PassThrough`).
    /// Reads the rest of the request head, dials the path's configured
    /// target, answers the upgrade, and runs the copy loop.
    pub async fn handle<S>(&self, id: u64, conn: &mut PeekableStream<S>, pool: &BufferPool) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let head = ws::read_http_head(conn).await?;
        let req = ws::parse_upgrade_request(&head)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed upgrade request"))?;

        let target = self.find(&req.path).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no target configured for path {}", req.path))
        })?;

        let protocol_header = req.header("Sec-WebSocket-Protocol").map(str::to_string);
        let early = protocol_header
            .as_deref()
            .and_then(early_data::decode)
            .unwrap_or_default();

        let (upstream, dial_comment): (BoxedStream, String) = match &target.kind {
            TargetKind::Tcp { target_address, proxy } => {
                let mut s = proxy.connect(target_address).await?;
                if !early.is_empty() {
                    s.write_all(&early).await?;
                }
                (Box::pin(s), target_address.clone())
            }
            TargetKind::InProcess { client_impl } => {
                let s = client_impl.dial(DialArgs { early_data: early.clone(), ..Default::default() }).await?;
                (s, format!("in-process:{}", client_impl.target()))
            }
        };

        log::info!(
            "[PXY] |ID:{}, CONN:WS, STATUS:DIAL, SIZE:0, COMMENT:{} |",
            id,
            dial_comment
        );

        if req.is_v2ray_raw_upgrade {
            ws::respond_raw_upgrade(conn).await?;
            // No WS framing in this mode: bytes after the header are the raw
            // application stream, same as a plain TCP tunnel.
            return tunnel_generic(id, conn, upstream, ConnType::WebSocket, pool).await;
        }

        let echo_protocol = (!early.is_empty()).then(|| protocol_header.as_deref().unwrap_or_default());
        ws::respond_switching_protocols(conn, &req, echo_protocol).await?;
        let ws_stream = WebSocketStream::from_raw_socket(conn, Role::Server, None).await;
        let byte_stream = ServerWsByteStream::new(ws_stream);
        tunnel_generic(id, byte_stream, upstream, ConnType::WebSocket, pool).await
    }
}

/// Same adapter technique as `client/ws::WsByteStream`, but generic over the
/// inbound transport (a `PeekableStream<S>` here, the dialed TLS/TCP stream
/// there) since the server side doesn't have a single concrete stream type.
struct ServerWsByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<S> ServerWsByteStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner, read_buf: Vec::new(), read_pos: 0 }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for ServerWsByteStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        loop {
            if self.read_pos < self.read_buf.len() {
                let available = &self.read_buf[self.read_pos..];
                let n = available.len().min(out.remaining());
                out.put_slice(&available[..n]);
                self.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.read_buf = data;
                    self.read_pos = 0;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Ok(_))) => continue,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for ServerWsByteStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, e))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

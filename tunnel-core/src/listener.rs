//! Component G: the accept loop. Grounded in the original's
//! `listener/listener.go` for the overall shape (bind, loop `Accept` with
//! backoff on transient errors, spawn a handler per connection) and in
//! `client/mtproxy/server_protocol/faketls.go` for the MTProto-FakeTLS
//! branch tried ahead of the ordinary fallback chain.

use socket2::{Domain, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::buffer_pool::BufferPool;
use crate::config::ListenerConfig;
use crate::error::{Result, TunnelError};
use crate::fallback::{Fallback, FallbackOutcome};
use crate::mtproto_protocol;
use crate::peekable::PeekableStream;
use crate::server_http::HttpMux;

static CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// An MTProto-FakeTLS entry pulled out of a listener's `tls-fallback` list:
/// any entry whose `mtp` field holds a hex secret is tried as a
/// cloak-or-relay target before the ordinary fallback chain runs, since a
/// genuine TLS ClientHello would otherwise just look like one more TLS
/// connection with no matching SNI.
///
/// Only the authentication and cloak/relay decision is reimplemented here;
/// the Telegram datacenter application-layer routing the original MTProto
/// proxy performs once authenticated is out of scope and the relay target
/// is a plain configured backend address instead.
struct MtprotoFakeTlsEntry {
    secret: Vec<u8>,
    relay_address: String,
}

/// Peel the `0xee<16-byte-secret><domain>` "FakeTLS" secret encoding (see
/// the CLI's `generate-secret` output) down to the raw 16-byte HMAC key; a
/// bare 16-byte secret is used as-is.
fn faketls_hmac_key(raw: &[u8]) -> Vec<u8> {
    if raw.len() > 17 && raw[0] == 0xee {
        raw[1..17].to_vec()
    } else {
        raw.to_vec()
    }
}

const MTPROTO_PEEK_LEN: usize = 4096;

pub struct Listener {
    bind_address: SocketAddr,
    tfo: bool,
    cloak_address: String,
    fallback: Option<Arc<Fallback>>,
    mtproto_entries: Vec<MtprotoFakeTlsEntry>,
    http_mux: Option<Arc<HttpMux>>,
    pool: BufferPool,
}

impl Listener {
    pub fn from_config(cfg: &ListenerConfig, proxy: &str, is_websocket_listener: bool) -> Result<Self> {
        let bind_address: SocketAddr = cfg
            .bind_address
            .parse()
            .map_err(|e| TunnelError::Config(format!("bad bind-address {}: {e}", cfg.bind_address)))?;

        let fallback = Fallback::from_config(&cfg.fallback, proxy, is_websocket_listener).map(Arc::new);

        let mtproto_entries = cfg
            .fallback
            .tls_fallback
            .iter()
            .filter_map(|e| {
                let secret_hex = e.mtp.as_ref()?;
                let secret = hex::decode(secret_hex).ok()?;
                Some(MtprotoFakeTlsEntry {
                    secret: faketls_hmac_key(&secret),
                    relay_address: e.address.clone(),
                })
            })
            .collect();

        Ok(Self {
            bind_address,
            tfo: cfg.tfo,
            cloak_address: cfg.fallback.tls_fallback_address.clone(),
            fallback,
            mtproto_entries,
            http_mux: None,
            pool: BufferPool::new(),
        })
    }

    /// Attach the path-routed WS/HTTP-upgrade multiplexer for a server
    /// listener; a plain client-side listener never sets this.
    pub fn with_http_mux(mut self, http_mux: Arc<HttpMux>) -> Self {
        self.http_mux = Some(http_mux);
        self
    }

    fn bind(&self) -> Result<TcpListener> {
        let domain = if self.bind_address.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)
            .map_err(|e| TunnelError::Bind { addr: self.bind_address.to_string(), source: e })?;
        socket.set_reuse_address(true).ok();
        if self.tfo {
            let _ = socket.set_tcp_fastopen(256);
        }
        socket
            .bind(&SockAddr::from(self.bind_address))
            .map_err(|e| TunnelError::Bind { addr: self.bind_address.to_string(), source: e })?;
        socket
            .listen(1024)
            .map_err(|e| TunnelError::Bind { addr: self.bind_address.to_string(), source: e })?;
        socket.set_nonblocking(true).ok();
        TcpListener::from_std(socket.into())
            .map_err(|e| TunnelError::Bind { addr: self.bind_address.to_string(), source: e })
    }

    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        log::info!("[PXY] |ID:0, CONN:, STATUS:LISTEN, SIZE:0, COMMENT:{} |", self.bind_address);

        let mut backoff = Duration::from_millis(5);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    backoff = Duration::from_millis(5);
                    let this = self.clone();
                    tokio::spawn(async move {
                        let id = next_id();
                        if let Err(e) = this.handle_connection(id, stream).await {
                            log::debug!("[PXY] |ID:{id}, CONN:, STATUS:XX, SIZE:0, COMMENT:{e} | peer={peer}");
                        }
                    });
                }
                Err(e) => {
                    log::warn!("accept error on {}: {e}", self.bind_address);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
    }

    async fn handle_connection(&self, id: u64, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true).ok();
        let mut conn = PeekableStream::new(stream);

        if !self.mtproto_entries.is_empty()
            && self.try_mtproto_fake_tls(id, &mut conn).await?
        {
            return Ok(());
        }

        if let Some(fallback) = &self.fallback {
            match fallback.handle(id, &mut conn, &self.pool).await? {
                FallbackOutcome::Tunneled => return Ok(()),
                FallbackOutcome::PassThrough => {}
            }
        }

        if let Some(http_mux) = &self.http_mux {
            return http_mux.handle(id, &mut conn, &self.pool).await;
        }

        // No fallback and no HTTP mux configured: nothing left to do with
        // this connection.
        Ok(())
    }

    /// Tries every configured FakeTLS identity against the same peeked
    /// ClientHello prefix. Returns `true` if the connection was fully
    /// handled (relayed after a successful handshake, or cloaked after
    /// every identity failed to verify).
    async fn try_mtproto_fake_tls(&self, id: u64, conn: &mut PeekableStream<TcpStream>) -> std::io::Result<bool> {
        let peeked = conn.peek(MTPROTO_PEEK_LEN).await.unwrap_or(&[]).to_vec();
        if peeked.is_empty() {
            return Ok(false);
        }

        let mut best_consumed: Vec<u8> = Vec::new();
        for entry in &self.mtproto_entries {
            let mut cursor: &[u8] = &peeked;
            match mtproto_protocol::try_fake_tls_handshake(&mut cursor, &entry.secret).await {
                Ok(()) => {
                    let consumed_len = peeked.len() - cursor.len();
                    let mut discard = vec![0u8; consumed_len];
                    conn.read_exact_compat(&mut discard).await?;

                    log::info!("[PXY] |ID:{id}, CONN:MTP, STATUS:DIAL, SIZE:0, COMMENT:{} |", entry.relay_address);
                    let mut relay = TcpStream::connect(&entry.relay_address).await?;
                    let mut record_stream = mtproto_protocol::FakeTlsRecordStream::new(conn);

                    loop {
                        let mut buf = [0u8; 4096];
                        let mut buf2 = [0u8; 4096];
                        tokio::select! {
                            r = record_stream.read(&mut buf) => {
                                let n = r?;
                                if n == 0 { break; }
                                relay.write_all(&buf[..n]).await?;
                            }
                            r = relay.read(&mut buf2) => {
                                let n = r?;
                                if n == 0 { break; }
                                record_stream.write_all(&buf2[..n]).await?;
                            }
                        }
                    }
                    return Ok(true);
                }
                Err(accept) => {
                    if accept.consumed.len() > best_consumed.len() {
                        best_consumed = accept.consumed;
                    }
                }
            }
        }

        if !self.cloak_address.is_empty() {
            mtproto_protocol::cloak(conn, &best_consumed, &self.cloak_address).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

impl PeekableStream<TcpStream> {
    /// Drain exactly `buf.len()` already-peeked bytes, falling back to the
    /// underlying socket only if fewer were peeked than requested.
    async fn read_exact_compat(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read draining peeked prefix"));
            }
            filled += n;
        }
        Ok(())
    }
}

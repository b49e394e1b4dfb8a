//! Component E: the fallback dispatcher. Ported from `fallback/fallback.go`'s
//! `Handle` state machine — peek a handful of bytes, try each protocol
//! tester in a fixed order, and either tunnel the connection to whatever
//! `ClientImpl` matched or hand it back to the caller unconsumed.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::buffer_pool::BufferPool;
use crate::classifier::{self, ss2022, ss_aead, tls_sni, vmess};
use crate::client::{ClientImpl, DialArgs};
use crate::config::FallbackConfig;
use crate::copy::{tunnel_generic, ConnType};
use crate::peekable::PeekableStream;

const PEEK_LEN: usize = 5;
const VMESS_PEEK_LEN: usize = 16;
const AEAD_PEEK_LEN: usize = 512;

pub enum FallbackOutcome {
    /// The connection was matched, dialed, and fully tunneled/closed.
    Tunneled,
    /// Nothing matched (or an explicit `accept()` case, e.g. a plain
    /// WebSocket-listener GET); the caller should continue normal handling,
    /// and may still read the peeked prefix via the same `PeekableStream`.
    PassThrough,
}

struct TlsEntry {
    sni: String,
    client: Arc<dyn ClientImpl>,
}

struct SsEntry {
    method: ss_aead::Method,
    password: String,
    client: Arc<dyn ClientImpl>,
}

struct Ss2022Entry {
    method: ss2022::Method,
    psk_chain: Vec<Vec<u8>>,
    client: Arc<dyn ClientImpl>,
}

struct VmessEntry {
    uuid: String,
    client: Arc<dyn ClientImpl>,
}

pub struct Fallback {
    ssh_client: Option<Arc<dyn ClientImpl>>,
    ssh_fallback_timeout: Duration,
    ws_client: Option<Arc<dyn ClientImpl>>,
    unknown_client: Option<Arc<dyn ClientImpl>>,
    tls_entries: Vec<TlsEntry>,
    ss_entries: Vec<SsEntry>,
    ss2022_entries: Vec<Ss2022Entry>,
    vmess_entries: Vec<VmessEntry>,
    is_websocket_listener: bool,
}

fn make_client(address: &str, proxy: &str) -> Arc<dyn ClientImpl> {
    Arc::new(crate::client::tcp::TcpClientImpl::new(address.to_string(), proxy))
}

impl Fallback {
    pub fn from_config(cfg: &FallbackConfig, proxy: &str, is_websocket_listener: bool) -> Option<Self> {
        let ssh_client = (!cfg.ssh_fallback_address.is_empty())
            .then(|| make_client(&cfg.ssh_fallback_address, proxy));
        let ws_client =
            (!cfg.ws_fallback_address.is_empty()).then(|| make_client(&cfg.ws_fallback_address, proxy));
        let unknown_client = (!cfg.unknown_fallback_address.is_empty())
            .then(|| make_client(&cfg.unknown_fallback_address, proxy));

        let mut tls_entries: Vec<TlsEntry> = cfg
            .tls_fallback
            .iter()
            .map(|e| TlsEntry {
                sni: e.sni.clone(),
                client: make_client(&e.address, proxy),
            })
            .collect();
        if !cfg.tls_fallback_address.is_empty() {
            tls_entries.push(TlsEntry {
                sni: String::new(),
                client: make_client(&cfg.tls_fallback_address, proxy),
            });
        }

        let ss_entries: Vec<SsEntry> = cfg
            .ss_fallback
            .iter()
            .filter_map(|e| {
                Some(SsEntry {
                    method: ss_aead::Method::parse(&e.method)?,
                    password: e.password.clone(),
                    client: make_client(&e.address, proxy),
                })
            })
            .collect();

        let ss2022_entries: Vec<Ss2022Entry> = cfg
            .ss2022_fallback
            .iter()
            .filter_map(|e| {
                Some(Ss2022Entry {
                    method: ss2022::Method::parse(&e.method)?,
                    psk_chain: ss2022::parse_psk_chain(&e.password)?,
                    client: make_client(&e.address, proxy),
                })
            })
            .collect();

        let vmess_entries: Vec<VmessEntry> = cfg
            .vmess_fallback
            .iter()
            .map(|e| VmessEntry {
                uuid: e.uuid.clone(),
                client: make_client(&e.address, proxy),
            })
            .collect();

        let has_any = ssh_client.is_some()
            || ws_client.is_some()
            || unknown_client.is_some()
            || !tls_entries.is_empty()
            || !ss_entries.is_empty()
            || !ss2022_entries.is_empty()
            || !vmess_entries.is_empty();

        has_any.then(|| Fallback {
            ssh_client,
            ssh_fallback_timeout: Duration::from_secs(cfg.ssh_fallback_timeout),
            ws_client,
            unknown_client,
            tls_entries,
            ss_entries,
            ss2022_entries,
            vmess_entries,
            is_websocket_listener,
        })
    }

    pub async fn handle<S>(
        &self,
        id: u64,
        conn: &mut PeekableStream<S>,
        pool: &BufferPool,
    ) -> std::io::Result<FallbackOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.ssh_fallback_timeout > Duration::ZERO && self.ssh_client.is_some() {
            conn.set_read_deadline(Some(self.ssh_fallback_timeout));
        }

        let peek_result = conn.peek(PEEK_LEN).await;
        conn.set_read_deadline(None);

        let prefix = match peek_result {
            Ok(p) => p.to_vec(),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                if let Some(client) = &self.ssh_client {
                    return self.tunnel(id, conn, client, pool).await;
                }
                return Ok(FallbackOutcome::PassThrough);
            }
            Err(_) => return Ok(FallbackOutcome::PassThrough),
        };

        if classifier::is_ssh_banner(&prefix) {
            if let Some(client) = &self.ssh_client {
                return self.tunnel(id, conn, client, pool).await;
            }
        } else if classifier::is_http_get(&prefix) {
            if self.is_websocket_listener {
                return Ok(FallbackOutcome::PassThrough);
            }
            if let Some(client) = &self.ws_client {
                return self.tunnel(id, conn, client, pool).await;
            }
        }

        if !self.tls_entries.is_empty() {
            if let Ok(peeked) = conn.peek(AEAD_PEEK_LEN).await {
                if classifier::is_tls_client_hello(peeked) {
                    let sni = tls_sni::extract_sni(peeked).unwrap_or_default();
                    let matched = self
                        .tls_entries
                        .iter()
                        .find(|e| e.sni == sni)
                        .or_else(|| self.tls_entries.iter().find(|e| e.sni.is_empty()));
                    if let Some(entry) = matched {
                        return self.tunnel(id, conn, &entry.client, pool).await;
                    }
                }
            }
        }

        if !self.vmess_entries.is_empty() {
            if let Ok(peeked) = conn.peek(VMESS_PEEK_LEN).await {
                let peeked = peeked.to_vec();
                for entry in &self.vmess_entries {
                    if vmess::try_match(&entry.uuid, &peeked) {
                        return self.tunnel(id, conn, &entry.client, pool).await;
                    }
                }
            }
        }

        if !self.ss_entries.is_empty() || !self.ss2022_entries.is_empty() {
            if let Ok(peeked) = conn.peek(AEAD_PEEK_LEN).await {
                let peeked = peeked.to_vec();
                for entry in &self.ss_entries {
                    if ss_aead::try_match(entry.method, &entry.password, &peeked) {
                        return self.tunnel(id, conn, &entry.client, pool).await;
                    }
                }
                for entry in &self.ss2022_entries {
                    if ss2022::try_match(entry.method, &entry.psk_chain, &peeked) {
                        return self.tunnel(id, conn, &entry.client, pool).await;
                    }
                }
            }
        }

        if let Some(client) = &self.unknown_client {
            return self.tunnel(id, conn, client, pool).await;
        }

        Ok(FallbackOutcome::PassThrough)
    }

    async fn tunnel<S>(
        &self,
        id: u64,
        conn: &mut PeekableStream<S>,
        client: &Arc<dyn ClientImpl>,
        pool: &BufferPool,
    ) -> std::io::Result<FallbackOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        conn.set_read_deadline(None);
        log::info!(
            "[PXY] |ID:{}, CONN:, STATUS:DIAL, SIZE:0, COMMENT:{} |",
            id,
            client.target()
        );
        let upstream = client.dial(DialArgs::default()).await?;
        tunnel_generic(id, conn, upstream, ConnType::Tcp, pool).await?;
        Ok(FallbackOutcome::Tunneled)
    }
}

//! Component K: the in-process graph linker.
//!
//! Grounded in `client/client.go`'s `BuildClient`/`StartClients` and
//! `server/server.go`'s `BuildServer`/`StartServers`: turn the parsed config
//! into a set of runnable listeners, then hand them to whoever owns the
//! process lifetime. The original keeps two global maps, `PortToClient` and
//! `PortToServer`, populated at init time and then walked once: any client
//! whose target is `127.0.0.1:<port>`/`localhost:<port>` of a
//! locally-configured listener gets rewritten onto that listener directly
//! rather than dialing itself over loopback. This builds the same two maps
//! (keyed by bind-address port, see `bind_port`) and runs the same one-time
//! link pass in `resolve_client_link` before any listener is constructed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener as RawTcpListener;

use crate::client::mtproto::MtprotoClientImpl;
use crate::client::tcp::TcpClientImpl;
use crate::client::ws::WsClientImpl;
use crate::client::{ClientImpl, DialArgs};
use crate::config::{ClientConfig, Config, ServerConfig};
use crate::copy::{tunnel_generic, ConnType};
use crate::error::Result;
use crate::listener::Listener;
use crate::peekable::PeekableStream;
use crate::server_http::HttpMux;
use crate::udp::UdpTunnel;

/// How long to wait for early-data bytes to arrive on the inbound socket
/// before dialing anyway with whatever showed up (possibly nothing).
const EARLY_DATA_WAIT: Duration = Duration::from_millis(200);

fn build_client_impl(cfg: &ClientConfig) -> Arc<dyn ClientImpl> {
    if cfg.mtp.is_some() {
        // dc_id 2 matches the original client's hardcoded default DC when
        // the config doesn't route to a specific datacenter.
        return Arc::new(MtprotoClientImpl::new(cfg.target_address.clone(), &cfg.proxy.proxy, 2));
    }
    if !cfg.target_address.is_empty() {
        return Arc::new(TcpClientImpl::new(cfg.target_address.clone(), &cfg.proxy.proxy));
    }
    Arc::new(WsClientImpl::new(cfg.ws_url.clone(), cfg.ws_headers.clone()))
}

/// The port a bind address listens on, for keying the link pass's two
/// registries (`bind_address` is always `host:port`).
fn bind_port(addr: &str) -> &str {
    addr.rsplit(':').next().unwrap_or(addr)
}

/// If `target` points at loopback (`127.0.0.1:<port>`, `localhost:<port>` or
/// `[::1]:<port>`), the port it names; `None` for anything else, including an
/// empty target (a ws-url-only or mtp client has nothing to collapse).
fn loopback_port(target: &str) -> Option<&str> {
    let (host, port) = target.rsplit_once(':')?;
    match host {
        "127.0.0.1" | "localhost" | "[::1]" | "" => Some(port),
        _ => None,
    }
}

enum LinkResolution<'a> {
    /// Not a loopback client, or resolves to nothing locally configured:
    /// build it exactly as written.
    Direct,
    /// This client's target is a locally-configured server's bind address;
    /// clone that server onto the client's own bind address and drop the
    /// client entirely.
    ToServer(usize),
    /// This client's target chains through one or more other local,
    /// loopback-target clients; dial with the chain's tail config instead of
    /// hopping through each intermediate client's own listener.
    ToClient(&'a ClientConfig),
}

/// Walk `clients[start]`'s target through the loopback chain it may form with
/// other locally-configured clients/servers, one step at a time, until it
/// either lands on a server, dead-ends on a non-loopback (or unconfigured)
/// target, or would cycle back on itself. A `visited` set keeps this
/// convergent even though it only ever runs once: without it, a config with
/// `a -> b -> a` would loop forever instead of resolving to `Direct`.
fn resolve_client_link<'a>(
    start: usize,
    clients: &'a [ClientConfig],
    port_to_server: &HashMap<&str, usize>,
    port_to_client: &HashMap<&str, usize>,
) -> LinkResolution<'a> {
    if clients[start].mtp.is_some() || clients[start].target_address.is_empty() {
        return LinkResolution::Direct;
    }

    let mut current = start;
    let mut visited = std::collections::HashSet::new();
    visited.insert(start);

    loop {
        let Some(port) = loopback_port(&clients[current].target_address) else {
            return if current == start { LinkResolution::Direct } else { LinkResolution::ToClient(&clients[current]) };
        };
        if let Some(&server_idx) = port_to_server.get(port) {
            return LinkResolution::ToServer(server_idx);
        }
        match port_to_client.get(port) {
            Some(&next) if visited.insert(next) => {
                current = next;
            }
            _ => {
                return if current == start {
                    LinkResolution::Direct
                } else {
                    LinkResolution::ToClient(&clients[current])
                };
            }
        }
    }
}

/// Render a client's `server-ws-path` template (§4.H auto-wiring): the only
/// substitution is `{port}`, filled in with the client's own bind-address
/// port — the port an application connects to locally, which is the port
/// this route effectively exposes over the paired server's mux.
fn render_ws_path(template: &str, client_bind_address: &str) -> String {
    template.replace("{port}", bind_port(client_bind_address))
}

/// A client-mode tunnel: accepts plain local TCP connections and forwards
/// each one through whichever `ClientImpl` the config selects.
struct ClientTunnel {
    bind_address: String,
    client_impl: Arc<dyn ClientImpl>,
    pool: crate::buffer_pool::BufferPool,
}

impl ClientTunnel {
    async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let listener = RawTcpListener::bind(&self.bind_address).await?;
        log::info!("[PXY] |ID:0, CONN:, STATUS:LISTEN, SIZE:0, COMMENT:{} |", self.bind_address);
        let mut id = 1u64;
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("client accept error on {}: {e}", self.bind_address);
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            };
            stream.set_nodelay(true).ok();
            let this = self.clone();
            let conn_id = id;
            id = id.wrapping_add(1);
            tokio::spawn(async move {
                if let Err(e) = this.handle(conn_id, stream).await {
                    log::debug!("client tunnel {}: {e}", this.bind_address);
                }
            });
        }
    }

    async fn handle(&self, id: u64, inbound: tokio::net::TcpStream) -> std::io::Result<()> {
        let mut conn = PeekableStream::new(inbound);

        let wanted = self.client_impl.early_data_len();
        let mut early_data = Vec::new();
        if wanted > 0 {
            conn.set_read_deadline(Some(EARLY_DATA_WAIT));
            let peek_result = conn.peek(wanted).await.map(|p| p.to_vec());
            conn.set_read_deadline(None);
            // On a timeout, whatever arrived before the deadline is still
            // buffered; re-peek with n=0 to retrieve it without blocking.
            let peeked = match peek_result {
                Ok(p) => p,
                Err(_) => conn.peek(0).await.unwrap_or(&[]).to_vec(),
            };
            if !peeked.is_empty() {
                let mut discard = vec![0u8; peeked.len()];
                let mut filled = 0;
                while filled < discard.len() {
                    let n = conn.read(&mut discard[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                early_data = peeked;
            }
        }

        let upstream = self.client_impl.dial(DialArgs { early_data, ..Default::default() }).await?;
        tunnel_generic(id, conn, upstream, ConnType::WebSocket, &self.pool).await
    }
}

pub struct Runtime {
    listeners: Vec<Arc<Listener>>,
    client_tunnels: Vec<Arc<ClientTunnel>>,
    udp_tunnels: Vec<Arc<UdpTunnel>>,
}

impl Runtime {
    pub fn build(cfg: &Config) -> Result<Self> {
        let port_to_server: HashMap<&str, usize> = cfg
            .servers
            .iter()
            .enumerate()
            .map(|(i, s)| (bind_port(&s.listener.bind_address), i))
            .collect();
        let port_to_client: HashMap<&str, usize> = cfg
            .clients
            .iter()
            .enumerate()
            .map(|(i, c)| (bind_port(&c.listener.bind_address), i))
            .collect();

        // Component K link pass: resolve every client's loopback target
        // before anything is built. A client that only exists to reach a
        // locally-configured server collapses into a clone of that server
        // bound to the client's own address; a client that chains through
        // other local clients dials with the chain's tail config instead.
        let mut server_clones: Vec<ServerConfig> = Vec::new();
        let mut surviving_clients: Vec<(&ClientConfig, &ClientConfig)> = Vec::new();
        for (i, client_cfg) in cfg.clients.iter().enumerate() {
            match resolve_client_link(i, &cfg.clients, &port_to_server, &port_to_client) {
                LinkResolution::ToServer(server_idx) => {
                    let mut cloned = cfg.servers[server_idx].clone();
                    cloned.listener.bind_address = client_cfg.listener.bind_address.clone();
                    server_clones.push(cloned);
                }
                LinkResolution::ToClient(tail) => surviving_clients.push((client_cfg, tail)),
                LinkResolution::Direct => surviving_clients.push((client_cfg, client_cfg)),
            }
        }

        // Component H auto-wiring: a surviving client with a non-empty
        // `server-ws-path` gets its `ClientImpl` registered as an in-process
        // route on every server mux built in this runtime, so a request
        // arriving on that path is dispatched straight to the client's own
        // dial logic instead of opening a real TCP socket to reach it.
        let mut client_tunnels = Vec::new();
        let mut auto_wired: Vec<(String, Arc<dyn ClientImpl>)> = Vec::new();
        if !cfg.disable_client {
            for (client_cfg, dial_cfg) in &surviving_clients {
                let client_impl = build_client_impl(dial_cfg);
                if !client_cfg.server_ws_path.is_empty() {
                    let path = render_ws_path(&client_cfg.server_ws_path, &client_cfg.listener.bind_address);
                    auto_wired.push((path, client_impl.clone()));
                }
                client_tunnels.push(Arc::new(ClientTunnel {
                    bind_address: client_cfg.listener.bind_address.clone(),
                    client_impl,
                    pool: crate::buffer_pool::BufferPool::new(),
                }));
            }
        }

        let mut listeners = Vec::new();
        if !cfg.disable_server {
            for server_cfg in cfg.servers.iter().chain(server_clones.iter()) {
                let mut http_mux = HttpMux::from_config(&server_cfg.target);
                for (path, client_impl) in &auto_wired {
                    http_mux.register_in_process(path.clone(), client_impl.clone());
                }
                // No listener-level proxy field on ServerConfig (only
                // per-target, via ServerTargetConfig.proxy): fallback clients
                // built for this listener always dial direct.
                let listener = Listener::from_config(&server_cfg.listener, "", true)?;
                listeners.push(Arc::new(listener.with_http_mux(Arc::new(http_mux))));
            }
        }

        let mut udp_tunnels = Vec::new();
        if !cfg.disable_udp {
            for udp_cfg in &cfg.udps {
                udp_tunnels.push(Arc::new(UdpTunnel::from_config(udp_cfg)));
            }
        }

        Ok(Self { listeners, client_tunnels, udp_tunnels })
    }

    /// Spawn every listener/tunnel as its own task and return their join
    /// handles; the caller (`runtime.rs`'s bootstrap) waits on a shutdown
    /// signal rather than on these directly, since none of them return
    /// short of an unrecoverable bind error.
    pub fn spawn_all(self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for l in self.listeners {
            handles.push(tokio::spawn(async move {
                if let Err(e) = l.serve().await {
                    log::error!("listener stopped: {e}");
                }
            }));
        }
        for c in self.client_tunnels {
            handles.push(tokio::spawn(async move {
                if let Err(e) = c.serve().await {
                    log::error!("client tunnel stopped: {e}");
                }
            }));
        }
        for u in self.udp_tunnels {
            handles.push(tokio::spawn(async move {
                if let Err(e) = u.serve().await {
                    log::error!("udp tunnel stopped: {e}");
                }
            }));
        }
        handles
    }
}

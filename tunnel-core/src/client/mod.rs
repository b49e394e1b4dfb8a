//! Component F: the outbound client abstraction. Every way this tunnel can
//! reach the far side — plain TCP, a WebSocket upgrade, or an
//! obfuscated2/MTProto transport — implements the same `ClientImpl` trait,
//! so `fallback.rs` and `server_http.rs` dial without caring which one they
//! got. Mirrors the original's `common.ClientImpl` interface
//! (`client/mtproxy` and sibling client packages all implement it).

pub mod mtproto;
pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// Blanket object-safe stream trait so every transport can return the same
/// boxed type regardless of its concrete I/O type.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Early data (0-RTT payload already peeked off the inbound connection) and
/// any headers worth forwarding (`ws-headers` passthrough, the inbound
/// request's own headers when re-dialing a WS listener's fallback).
#[derive(Default, Clone)]
pub struct DialArgs {
    pub early_data: Vec<u8>,
    pub inbound_headers: HashMap<String, String>,
}

#[async_trait]
pub trait ClientImpl: Send + Sync {
    async fn dial(&self, args: DialArgs) -> io::Result<BoxedStream>;
    fn target(&self) -> &str;
    fn proxy(&self) -> &str;

    /// How many bytes of 0-RTT early data this client wants read off the
    /// inbound connection before dialing (the WS client's `?ed=N`); zero for
    /// every client that doesn't support it.
    fn early_data_len(&self) -> usize {
        0
    }
}

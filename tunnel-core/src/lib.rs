//! Library surface for the tunnel gateway: a bidirectional TCP/WebSocket
//! tunnel with protocol-aware fallback routing. `runtime.rs` is the one
//! entry point most callers need (`tunnel_core::runtime::run`); the rest of
//! the modules are exposed for the CLI crate and for integration tests.

pub mod buffer_pool;
pub mod classifier;
pub mod client;
pub mod config;
pub mod copy;
pub mod early_data;
pub mod error;
pub mod fallback;
pub mod listener;
pub mod mtproto_protocol;
pub mod peekable;
pub mod proxy_dialer;
pub mod registry;
pub mod runtime;
pub mod secret;
pub mod server_http;
pub mod udp;
pub mod ws;

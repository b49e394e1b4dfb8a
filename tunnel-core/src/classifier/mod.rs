//! Component D: protocol classifiers run against the first bytes of a
//! connection. Each submodule answers one question — "could this be
//! protocol X" — given only a peeked prefix; `fallback.rs` owns the order
//! they're tried in and what happens on a match.

pub mod quic;
pub mod ss2022;
pub mod ss_aead;
pub mod tls_sni;
pub mod vmess;

/// Byte-walk detector for the two non-TLS prefixes the original fallback
/// chain matches before trying any cryptographic tester: an SSH banner and
/// an HTTP request line (the latter en route to a WebSocket upgrade).
/// Mirrors the teacher's `detect_connection_type` byte-prefix switch
/// (`router-core/src/app/proxy.rs`).
pub fn is_ssh_banner(buf: &[u8]) -> bool {
    buf.len() >= 5 && &buf[0..5] == b"SSH-2"
}

pub fn is_http_get(buf: &[u8]) -> bool {
    buf.len() >= 5 && &buf[0..5] == b"GET /"
}

pub fn is_tls_client_hello(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[0] == 0x16 && buf[1] == 0x03 && buf[2] == 0x01
}

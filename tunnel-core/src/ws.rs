//! Component C: WebSocket upgrade handling, both sides.
//!
//! Server side performs the RFC 6455 handshake by hand, in the same
//! byte-walk style as the teacher's `extract_http_host`/`is_websocket_upgrade`
//! (`router-core/src/app/proxy.rs`) rather than pulling in a full HTTP
//! server stack for a single upgrade line. Client side dials via
//! `tokio-tungstenite` over `tokio-rustls`, the stack already used for TLS
//! dialing elsewhere in this crate.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{Request, Uri};
use tokio_tungstenite::{client_async_tls, MaybeTlsStream, WebSocketStream};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Parsed request line + headers of an HTTP Upgrade request, enough to
/// answer it without a general-purpose HTTP parser.
pub struct UpgradeRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub is_v2ray_raw_upgrade: bool,
}

impl UpgradeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a buffered HTTP request (headers only, `\r\n\r\n`-terminated).
pub fn parse_upgrade_request(buf: &[u8]) -> Option<UpgradeRequest> {
    let text = std::str::from_utf8(buf).ok()?;
    let header_end = text.find("\r\n\r\n")?;
    let head = &text[..header_end];
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?.to_string();
    if method != "GET" {
        return None;
    }

    let mut headers = Vec::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let has_ws_key = headers
        .iter()
        .any(|(k, _)| k.eq_ignore_ascii_case("Sec-WebSocket-Key"));
    let is_v2ray_raw_upgrade = !has_ws_key
        && headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("Upgrade") && v.eq_ignore_ascii_case("websocket")
        });

    Some(UpgradeRequest {
        path,
        headers,
        is_v2ray_raw_upgrade,
    })
}

pub fn looks_like_upgrade(buf: &[u8]) -> bool {
    buf.len() >= 4 && &buf[0..4] == b"GET "
}

fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Write the 101 response for a standard RFC 6455 handshake. When
/// `echo_protocol` is `Some`, it's echoed back verbatim as
/// `Sec-WebSocket-Protocol` — required whenever the request's own
/// `Sec-WebSocket-Protocol` carried decodable early data.
pub async fn respond_switching_protocols<W: AsyncWrite + Unpin>(
    w: &mut W,
    req: &UpgradeRequest,
    echo_protocol: Option<&str>,
) -> io::Result<()> {
    let key = req
        .header("Sec-WebSocket-Key")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing Sec-WebSocket-Key"))?;
    let accept = accept_key(key);
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(proto) = echo_protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
    }
    response.push_str("\r\n");
    w.write_all(response.as_bytes()).await
}

/// v2ray's "http-upgrade" transport skips the key/accept dance entirely:
/// once the Upgrade/Connection headers are present, a bare 101 with no
/// Sec-WebSocket-Accept is enough, and bytes after the header block are
/// raw application data (not WS frames).
pub async fn respond_raw_upgrade<W: AsyncWrite + Unpin>(w: &mut W) -> io::Result<()> {
    w.write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n")
        .await
}

/// Read a buffered HTTP request off `r` until the header terminator,
/// returning the raw bytes read (headers plus any early-data bytes that
/// arrived in the same packet) so the caller can hand leftovers to the
/// classifier/copy engine without losing them.
pub async fn read_http_head<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated request"));
        }
        buf.push(byte[0]);
        if buf.len() >= 4 && &buf[buf.len() - 4..] == b"\r\n\r\n" {
            return Ok(buf);
        }
        if buf.len() > 64 * 1024 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
    }
}

pub type ClientWsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial a WS/WSS endpoint, optionally carrying early data in
/// `Sec-WebSocket-Protocol` (see `early_data.rs`) and arbitrary passthrough
/// headers from `ws-headers` in the config.
pub async fn dial(
    url: &str,
    headers: &std::collections::HashMap<String, String>,
    early_data_protocol: Option<&str>,
) -> io::Result<ClientWsStream> {
    let uri: Uri = url
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad ws-url: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "ws-url has no host"))?;
    let port = uri.port_u16().unwrap_or(if uri.scheme_str() == Some("wss") {
        443
    } else {
        80
    });

    let tcp = tokio::net::TcpStream::connect((host, port)).await?;

    let mut builder = Request::builder()
        .method("GET")
        .uri(uri.clone())
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());

    if let Some(proto) = early_data_protocol {
        builder = builder.header("Sec-WebSocket-Protocol", proto);
    }
    for (k, v) in headers {
        builder = builder.header(k.as_str(), v.as_str());
    }

    let request = builder
        .body(())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let (stream, _response) = client_async_tls(request, tcp)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("ws handshake: {e}")))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // RFC 6455 section 1.3's worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parses_standard_upgrade_request() {
        let raw = b"GET /tun HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let req = parse_upgrade_request(raw).unwrap();
        assert_eq!(req.path, "/tun");
        assert!(!req.is_v2ray_raw_upgrade);
        assert_eq!(req.header("host"), Some("example.com"));
    }

    #[test]
    fn detects_v2ray_raw_upgrade_without_ws_key() {
        let raw = b"GET /tun HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let req = parse_upgrade_request(raw).unwrap();
        assert!(req.is_v2ray_raw_upgrade);
    }
}

//! End-to-end scenarios driven against real loopback sockets: one config is
//! parsed, linked into a `Runtime`, spawned, and then exercised with plain
//! `TcpStream`/`UdpSocket` clients the way a real caller would connect.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use tunnel_core::classifier::ss_aead;
use tunnel_core::config::parse_config;
use tunnel_core::registry::Runtime;
use tunnel_core::udp::UdpTunnel;

/// Spawn a plain echo server that writes back whatever it reads, for as long
/// as the connection stays open.
async fn spawn_echo_server(addr: &str) {
    let listener = TcpListener::bind(addr).await.expect("bind echo server");
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if sock.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
}

async fn start(yaml: &str) {
    let cfg = parse_config(yaml).expect("parse config");
    let runtime = Runtime::build(&cfg).expect("build runtime");
    runtime.spawn_all();
    // give every listener/tunnel task a chance to bind before the test
    // starts connecting to it.
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[tokio::test]
async fn s1_tcp_to_tcp() {
    spawn_echo_server("127.0.0.1:19001").await;
    start(
        r#"
client:
  - bind-address: "127.0.0.1:17001"
    target-address: "127.0.0.1:19001"
"#,
    )
    .await;

    let mut conn = TcpStream::connect("127.0.0.1:17001").await.unwrap();
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn s2_tcp_to_ws() {
    spawn_echo_server("127.0.0.1:19002").await;
    start(
        r#"
server:
  - bind-address: "127.0.0.1:18002"
    target:
      - target-address: "127.0.0.1:19002"
        ws-path: "/tun"
client:
  - bind-address: "127.0.0.1:17002"
    ws-url: "ws://127.0.0.1:18002/tun"
"#,
    )
    .await;

    let mut conn = TcpStream::connect("127.0.0.1:17002").await.unwrap();
    let payload = vec![0x5Au8; 64 * 1024];
    conn.write_all(&payload).await.unwrap();

    let mut received = vec![0u8; payload.len()];
    conn.read_exact(&mut received).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn s3_xray_early_data() {
    spawn_echo_server("127.0.0.1:19003").await;
    start(
        r#"
server:
  - bind-address: "127.0.0.1:18003"
    target:
      - target-address: "127.0.0.1:19003"
        ws-path: "/tun"
client:
  - bind-address: "127.0.0.1:17003"
    ws-url: "ws://127.0.0.1:18003/tun?ed=2048"
"#,
    )
    .await;

    let mut conn = TcpStream::connect("127.0.0.1:17003").await.unwrap();
    conn.write_all(b"FIRSTDATA").await.unwrap();
    // Give the client side's early-data peek its full window before sending
    // the rest, so the two writes aren't coalesced into one early-data read.
    tokio::time::sleep(Duration::from_millis(250)).await;
    conn.write_all(b"SECOND").await.unwrap();

    let mut received = vec![0u8; b"FIRSTDATASECOND".len()];
    conn.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"FIRSTDATASECOND");
}

#[tokio::test]
async fn s4_sni_tls_fallback() {
    spawn_echo_server("127.0.0.1:19101").await;
    spawn_echo_server("127.0.0.1:19102").await;
    start(
        r#"
server:
  - bind-address: "127.0.0.1:18004"
    tls-fallback:
      - sni: "a.example"
        address: "127.0.0.1:19101"
      - sni: ""
        address: "127.0.0.1:19102"
"#,
    )
    .await;

    // The fallback dispatcher peeks a fixed-size window before giving up on
    // a TLS match, so pad past it rather than relying on EOF (shutting the
    // write half early would race the echoed reply back through the same
    // tunnel_generic loop).
    let mut matched = TcpStream::connect("127.0.0.1:18004").await.unwrap();
    let hello_a = padded_record(build_client_hello("a.example"));
    matched.write_all(&hello_a).await.unwrap();
    let mut echoed = vec![0u8; hello_a.len()];
    matched.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, hello_a, "a.example should route to :19101 and echo back");

    let mut wildcard = TcpStream::connect("127.0.0.1:18004").await.unwrap();
    let hello_b = padded_record(build_client_hello("b.example"));
    wildcard.write_all(&hello_b).await.unwrap();
    let mut echoed_b = vec![0u8; hello_b.len()];
    wildcard.read_exact(&mut echoed_b).await.unwrap();
    assert_eq!(echoed_b, hello_b, "an unmatched SNI should fall through to the wildcard entry");
}

#[tokio::test]
async fn s5_ss_aead_tenant_routing() {
    spawn_echo_server("127.0.0.1:19105").await;
    start(
        r#"
server:
  - bind-address: "127.0.0.1:18005"
    ss-fallback:
      - name: "alice"
        method: "aes-128-gcm"
        password: "p"
        address: "127.0.0.1:19105"
"#,
    )
    .await;

    let sealed = padded_record(build_ss_aead_prefix("p"));
    let mut conn = TcpStream::connect("127.0.0.1:18005").await.unwrap();
    conn.write_all(&sealed).await.unwrap();
    let mut echoed = vec![0u8; sealed.len()];
    conn.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, sealed, "a correctly-sealed prefix under alice's key should route to her target");
}

#[tokio::test]
async fn s6_udp_wireguard_reserved_bytes() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let cfg_yaml = format!(
        r#"
udp:
  - bind-address: "127.0.0.1:18006"
    target-address: "{upstream_addr}"
    reserved: [170, 187, 204]
"#
    );
    let cfg = parse_config(&cfg_yaml).unwrap();
    let tunnel = std::sync::Arc::new(UdpTunnel::from_config(&cfg.udps[0]));
    tokio::spawn(tunnel.serve());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect("127.0.0.1:18006").await.unwrap();

    // message type byte + three reserved placeholder bytes (left as zero
    // here; the tunnel must overwrite them with `reserved` on the way out).
    let mut outbound = vec![4u8, 0, 0, 0];
    outbound.extend_from_slice(b"ping");
    client.send(&outbound).await.unwrap();

    let mut buf = [0u8; 512];
    let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[1..4], &[0xAA, 0xBB, 0xCC], "outbound reserved bytes must be rewritten");
    assert_eq!(&buf[4..n], b"ping");

    // the upstream (e.g. a WireGuard peer) replies with its own reserved
    // bytes set; the tunnel must zero them before relaying back to the
    // original client.
    let mut inbound = vec![4u8, 0xAA, 0xBB, 0xCC];
    inbound.extend_from_slice(b"pong");
    upstream.send_to(&inbound, peer).await.unwrap();

    let mut reply = [0u8; 512];
    let n = client.recv(&mut reply).await.unwrap();
    assert_eq!(&reply[1..4], &[0, 0, 0], "inbound reserved bytes must be zeroed");
    assert_eq!(&reply[4..n], b"pong");
}

/// The fallback dispatcher peeks a fixed 512-byte window before running the
/// TLS/AEAD testers; pad a short synthetic prefix past that so the peek
/// resolves on its own rather than needing the connection to half-close.
fn padded_record(mut buf: Vec<u8>) -> Vec<u8> {
    if buf.len() < 600 {
        buf.resize(600, 0);
    }
    buf
}

/// Build a minimal-but-well-formed TLS 1.2 ClientHello record carrying a
/// single SNI hostname, the same shape `classifier::tls_sni`'s own tests use.
fn build_client_hello(sni: &str) -> Vec<u8> {
    let mut ext = vec![0u8, 0u8]; // server_name extension type
    let hostname = sni.as_bytes();
    let server_name_entry_len = 1 + 2 + hostname.len();
    let sni_list_len = server_name_entry_len;
    let ext_len = 2 + sni_list_len;
    ext.extend_from_slice(&(ext_len as u16).to_be_bytes());
    ext.extend_from_slice(&(sni_list_len as u16).to_be_bytes());
    ext.push(0); // name type: hostname
    ext.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
    ext.extend_from_slice(hostname);

    let mut body = Vec::new();
    body.extend_from_slice(&[3, 3]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&[0, 2]);
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![1u8];
    handshake.extend_from_slice(&((body.len() as u32).to_be_bytes()[1..]));
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 3, 1];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Build a genuinely AES-128-GCM-sealed length chunk under `password`, the
/// same construction `classifier::ss_aead`'s own tests use to exercise
/// `try_match` from the other side.
fn build_ss_aead_prefix(password: &str) -> Vec<u8> {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::Aes128Gcm;

    let master_key = ss_aead::derive_master_key(password, 16);
    let salt = [9u8; 16];
    let hk = hkdf::Hkdf::<sha1::Sha1>::new(Some(&salt), &master_key);
    let mut subkey = [0u8; 16];
    hk.expand(b"ss-subkey", &mut subkey).unwrap();

    let cipher = Aes128Gcm::new_from_slice(&subkey).unwrap();
    let nonce = [0u8; 12];
    let sealed = cipher
        .encrypt(&nonce.into(), Payload { msg: &100u16.to_be_bytes(), aad: &[] })
        .unwrap();

    let mut out = salt.to_vec();
    out.extend_from_slice(&sealed);
    out
}

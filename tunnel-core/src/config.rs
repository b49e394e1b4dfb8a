//! Configuration schema and loader.
//!
//! Field names mirror the original `gopkg.in/yaml.v3` struct tags one for
//! one (`bind-address`, `target-address`, `ws-url`, ...) so that a config
//! file written against the original tunnel loads here unchanged.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FallbackConfig {
    #[serde(rename = "ssh-fallback-address", default)]
    pub ssh_fallback_address: String,
    #[serde(rename = "ssh-fallback-timeout", default)]
    pub ssh_fallback_timeout: u64,
    #[serde(rename = "tls-fallback-address", default)]
    pub tls_fallback_address: String,
    #[serde(rename = "ws-fallback-address", default)]
    pub ws_fallback_address: String,
    #[serde(rename = "unknown-fallback-address", default)]
    pub unknown_fallback_address: String,
    #[serde(rename = "tls-fallback", default)]
    pub tls_fallback: Vec<TlsFallbackEntry>,
    #[serde(rename = "quic-fallback", default)]
    pub quic_fallback: Vec<QuicFallbackEntry>,
    #[serde(rename = "ss-fallback", default)]
    pub ss_fallback: Vec<SsFallbackEntry>,
    #[serde(rename = "ss2022-fallback", default)]
    pub ss2022_fallback: Vec<Ss2022FallbackEntry>,
    #[serde(rename = "vmess-fallback", default)]
    pub vmess_fallback: Vec<VmessFallbackEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsFallbackEntry {
    #[serde(default)]
    pub sni: String,
    pub address: String,
    #[serde(default)]
    pub mtp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuicFallbackEntry {
    #[serde(default)]
    pub sni: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsFallbackEntry {
    pub name: String,
    pub method: String,
    pub password: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ss2022FallbackEntry {
    pub name: String,
    pub method: String,
    pub password: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmessFallbackEntry {
    pub name: String,
    pub uuid: String,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(rename = "bind-address")]
    pub bind_address: String,
    #[serde(flatten)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub mptcp: bool,
    #[serde(default)]
    pub tfo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub listener: ListenerConfig,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
    #[serde(rename = "target-address", default)]
    pub target_address: String,
    #[serde(rename = "ws-url", default)]
    pub ws_url: String,
    #[serde(rename = "ws-headers", default)]
    pub ws_headers: std::collections::HashMap<String, String>,
    #[serde(rename = "v2ray-http-upgrade", default)]
    pub v2ray_http_upgrade: bool,
    #[serde(rename = "skip-cert-verify", default)]
    pub skip_cert_verify: bool,
    #[serde(default)]
    pub servername: String,
    #[serde(rename = "server-ws-path", default)]
    pub server_ws_path: String,
    #[serde(default)]
    pub mtp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTargetConfig {
    #[serde(rename = "target-address")]
    pub target_address: String,
    #[serde(rename = "ws-path")]
    pub ws_path: String,
    #[serde(flatten)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub target: Vec<ServerTargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UdpConfig {
    #[serde(rename = "bind-address")]
    pub bind_address: String,
    #[serde(rename = "target-address")]
    pub target_address: String,
    #[serde(default)]
    pub reserved: Vec<u8>,
    #[serde(default)]
    pub mmsg: bool,
    #[serde(rename = "ss-fallback", default)]
    pub ss_fallback: Vec<SsFallbackEntry>,
    #[serde(rename = "ss2022-fallback", default)]
    pub ss2022_fallback: Vec<Ss2022FallbackEntry>,
    #[serde(rename = "quic-fallback", default)]
    pub quic_fallback: Vec<QuicFallbackEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerConfig>,
    #[serde(rename = "client", default)]
    pub clients: Vec<ClientConfig>,
    #[serde(rename = "udp", default)]
    pub udps: Vec<UdpConfig>,
    #[serde(rename = "disable-server", default)]
    pub disable_server: bool,
    #[serde(rename = "disable-client", default)]
    pub disable_client: bool,
    #[serde(rename = "disable-udp", default)]
    pub disable_udp: bool,
    #[serde(rename = "disable-log", default)]
    pub disable_log: bool,
}

pub fn read_config(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| TunnelError::Config(format!("reading {}: {}", path.display(), e)))
}

pub fn parse_config(buf: &str) -> Result<Config> {
    if buf.trim().is_empty() {
        return Err(TunnelError::Config("config file is empty".into()));
    }
    serde_yaml::from_str(buf).map_err(|e| TunnelError::Config(format!("parsing yaml: {e}")))
}

pub fn load(path: &Path) -> Result<Config> {
    parse_config(&read_config(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
client:
  - bind-address: "127.0.0.1:7001"
    target-address: "127.0.0.1:9001"
server:
  - bind-address: "127.0.0.1:8443"
    target:
      - target-address: "127.0.0.1:9001"
        ws-path: "/tun"
"#;
        let cfg = parse_config(yaml).unwrap();
        assert_eq!(cfg.clients.len(), 1);
        assert_eq!(cfg.clients[0].target_address, "127.0.0.1:9001");
        assert_eq!(cfg.servers[0].target[0].ws_path, "/tun");
    }

    #[test]
    fn empty_config_is_an_error() {
        assert!(parse_config("").is_err());
    }

    #[test]
    fn tls_fallback_entries_round_trip() {
        let yaml = r#"
client:
  - bind-address: "0.0.0.0:443"
    target-address: "127.0.0.1:1"
    tls-fallback:
      - sni: "a.example"
        address: "127.0.0.1:9101"
      - sni: ""
        address: "127.0.0.1:9102"
"#;
        let cfg = parse_config(yaml).unwrap();
        let fb = &cfg.clients[0].listener.fallback.tls_fallback;
        assert_eq!(fb.len(), 2);
        assert_eq!(fb[0].sni, "a.example");
        assert_eq!(fb[1].sni, "");
    }
}

//! Shadowsocks 2022 tester, grounded in `fallback/ss2022/method.go`: PSKs
//! are base64, colon-separated in config (`iPSK1:iPSK2:...:PSK`), the
//! session key comes from `blake3::derive_key` with context
//! `"shadowsocks 2022 session subkey"` over the PSK and session salt, and
//! the wire cipher is AES-GCM keyed by that session key.
//!
//! Only the AES-GCM method family is implemented — this crate doesn't carry
//! an AES-CCM dependency, and the distilled config surface only exercises
//! the GCM variants.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use base64::Engine;

const SESSION_SUBKEY_CONTEXT: &str = "shadowsocks 2022 session subkey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Blake3Aes128Gcm,
    Blake3Aes256Gcm,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "2022-blake3-aes-128-gcm" => Some(Method::Blake3Aes128Gcm),
            "2022-blake3-aes-256-gcm" => Some(Method::Blake3Aes256Gcm),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            Method::Blake3Aes128Gcm => 16,
            Method::Blake3Aes256Gcm => 32,
        }
    }
}

/// Parse the colon-separated PSK chain from config, each entry base64.
pub fn parse_psk_chain(raw: &str) -> Option<Vec<Vec<u8>>> {
    raw.split(':')
        .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64).ok())
        .collect()
}

fn session_key(psk_chain: &[Vec<u8>], salt: &[u8], key_len: usize) -> Vec<u8> {
    // The identity-PSK chain exists to let a server demultiplex multiple
    // users sharing one listener; for a fallback classifier we only need
    // the final PSK that actually encrypts payload, so fold the chain into
    // one key and derive the session subkey from it.
    let mut folded = psk_chain.last().cloned().unwrap_or_default();
    for ipsk in psk_chain.iter().rev().skip(1) {
        for (i, b) in ipsk.iter().enumerate() {
            if i < folded.len() {
                folded[i] ^= b;
            }
        }
    }

    let mut material = folded;
    material.extend_from_slice(salt);
    let derived = blake3::derive_key(SESSION_SUBKEY_CONTEXT, &material);
    derived[..key_len].to_vec()
}

/// Trial-decrypt the first sealed length chunk, same shape as the AEAD-1
/// tester but with a method-sized salt (16 bytes for AES-128, 32 for
/// AES-256) instead of a fixed 16/32-from-key-len salt.
pub fn try_match(method: Method, psk_chain: &[Vec<u8>], peeked: &[u8]) -> bool {
    let key_len = method.key_len();
    let salt_len = key_len;
    let min_len = salt_len + 2 + 16;
    if peeked.len() < min_len {
        return false;
    }

    let salt = &peeked[..salt_len];
    let key = session_key(psk_chain, salt, key_len);
    let sealed = &peeked[salt_len..salt_len + 2 + 16];
    let nonce = [0u8; 12];

    let plaintext = match method {
        Method::Blake3Aes128Gcm => Aes128Gcm::new_from_slice(&key)
            .ok()
            .and_then(|c| c.decrypt(&nonce.into(), Payload { msg: sealed, aad: &[] }).ok()),
        Method::Blake3Aes256Gcm => Aes256Gcm::new_from_slice(&key)
            .ok()
            .and_then(|c| c.decrypt(&nonce.into(), Payload { msg: sealed, aad: &[] }).ok()),
    };

    match plaintext {
        Some(pt) if pt.len() == 2 => {
            let len = u16::from_be_bytes([pt[0], pt[1]]) as usize;
            len > 0 && len <= 0x3fff
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_buffers() {
        assert!(!try_match(Method::Blake3Aes128Gcm, &[vec![1; 16]], &[0u8; 8]));
    }

    #[test]
    fn accepts_a_genuinely_sealed_length_chunk() {
        let psk = vec![9u8; 16];
        let chain = vec![psk];
        let method = Method::Blake3Aes128Gcm;
        let salt = [3u8; 16];
        let key = session_key(&chain, &salt, method.key_len());
        let cipher = Aes128Gcm::new_from_slice(&key).unwrap();
        let nonce = [0u8; 12];
        let sealed = cipher
            .encrypt(&nonce.into(), Payload { msg: &50u16.to_be_bytes(), aad: &[] })
            .unwrap();

        let mut peeked = salt.to_vec();
        peeked.extend_from_slice(&sealed);
        assert!(try_match(method, &chain, &peeked));
    }

    #[test]
    fn parses_colon_separated_base64_chain() {
        let chain = parse_psk_chain("AAAAAAAAAAAAAAAAAAAAAA==:AQEBAQEBAQEBAQEBAQEBAQ==").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].len(), 16);
    }
}

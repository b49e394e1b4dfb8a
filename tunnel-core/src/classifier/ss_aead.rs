//! Shadowsocks AEAD tester, grounded in `fallback/ssaead/aead.go`: derive
//! the master key by MD5 password-stretching, derive the per-session subkey
//! with HKDF-SHA1 (info `"ss-subkey"`), then attempt to AEAD-decrypt the
//! leading 2-byte length chunk. A clean decrypt is treated as a match —
//! the original accepts the same false-positive rate this reproduces.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "aes-128-gcm" => Some(Method::Aes128Gcm),
            "aes-256-gcm" => Some(Method::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Some(Method::ChaCha20Poly1305),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            Method::Aes128Gcm => 16,
            Method::Aes256Gcm | Method::ChaCha20Poly1305 => 32,
        }
    }

    fn salt_len(self) -> usize {
        self.key_len()
    }
}

/// MD5 password stretching, OpenSSL's `EVP_BytesToKey` with no salt/IV:
/// repeatedly hash `prev || password` until the key material is long enough.
pub fn derive_master_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(key_len + Md5::output_size());
    let mut prev: Vec<u8> = Vec::new();
    while out.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        out.extend_from_slice(&digest);
        prev = digest.to_vec();
    }
    out.truncate(key_len);
    out
}

fn session_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .expect("subkey length is always valid for SHA1 HKDF output");
    subkey
}

/// Trial-decrypt the first AEAD-sealed length chunk. `peeked` must contain
/// at least `salt_len + 2 + 16` bytes (salt, sealed 2-byte length, its tag).
pub fn try_match(method: Method, password: &str, peeked: &[u8]) -> bool {
    let key_len = method.key_len();
    let salt_len = method.salt_len();
    let min_len = salt_len + 2 + 16;
    if peeked.len() < min_len {
        return false;
    }

    let master_key = derive_master_key(password, key_len);
    let salt = &peeked[..salt_len];
    let subkey = session_subkey(&master_key, salt, key_len);
    let sealed = &peeked[salt_len..salt_len + 2 + 16];
    let nonce = [0u8; 12]; // first chunk always uses the zero nonce

    let plaintext = match method {
        Method::Aes128Gcm => Aes128Gcm::new_from_slice(&subkey)
            .ok()
            .and_then(|c| c.decrypt(&nonce.into(), Payload { msg: sealed, aad: &[] }).ok()),
        Method::Aes256Gcm => Aes256Gcm::new_from_slice(&subkey)
            .ok()
            .and_then(|c| c.decrypt(&nonce.into(), Payload { msg: sealed, aad: &[] }).ok()),
        Method::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&subkey)
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
    fn rejects_garbage_without_panicking() {
        let junk = vec![0u8; 64];
        assert!(!try_match(Method::Aes128Gcm, "pw", &junk));
    }

    #[test]
    fn accepts_a_genuinely_sealed_length_chunk() {
        let password = "correct horse";
        let method = Method::Aes128Gcm;
        let master_key = derive_master_key(password, method.key_len());
        let salt = [7u8; 16];
        let subkey = session_subkey(&master_key, &salt, method.key_len());
        let cipher = Aes128Gcm::new_from_slice(&subkey).unwrap();
        let nonce = [0u8; 12];
        let sealed = cipher
            .encrypt(&nonce.into(), Payload { msg: &100u16.to_be_bytes(), aad: &[] })
            .unwrap();

        let mut peeked = salt.to_vec();
        peeked.extend_from_slice(&sealed);
        assert!(try_match(method, password, &peeked));
    }

    #[test]
    fn method_parse_rejects_unknown_names() {
        assert_eq!(Method::parse("rc4-md5"), None);
        assert_eq!(Method::parse("aes-256-gcm"), Some(Method::Aes256Gcm));
    }
}

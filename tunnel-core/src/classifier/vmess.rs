//! VMess AEAD auth-ID tester, grounded in `fallback/vmessaead/protocol.go`:
//! `cmdKey = MD5(uuid || magic)`, a block key derived from `cmdKey` via
//! HKDF-SHA256, then the 16 peeked bytes are AES-ECB-decrypted with that
//! block key. A match is a CRC32 of the first 12 decrypted bytes equal to
//! the last 4 (big-endian) — VMess's AuthID carries its own checksum, so
//! a clean checksum is strong evidence (not just a timestamp-range guess).

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, KeyInit};
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha2::Sha256;

const AUTH_ID_ENCRYPTION_KEY: &[u8] = b"AES Auth ID Encryption";
const CMD_KEY_MAGIC: &str = "c48619fe-8f02-49e0-b9e9-edf763e17e21";

pub fn cmd_key(uuid: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(uuid.as_bytes());
    hasher.update(CMD_KEY_MAGIC.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

fn block_key(cmd_key: &[u8; 16]) -> [u8; 16] {
    let hk = Hkdf::<Sha256>::new(None, cmd_key);
    let mut out = [0u8; 16];
    hk.expand(AUTH_ID_ENCRYPTION_KEY, &mut out)
        .expect("16 bytes is always a valid SHA-256 HKDF output length");
    out
}

/// `peeked` must be the 16-byte AuthID that opens a VMess AEAD request.
pub fn try_match(uuid: &str, peeked: &[u8]) -> bool {
    if peeked.len() < 16 {
        return false;
    }
    let cmd = cmd_key(uuid);
    let key = block_key(&cmd);
    let cipher = aes::Aes128::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(&peeked[..16]);
    cipher.decrypt_block(&mut block);

    let checksum = crc32fast::hash(&block[..12]);
    let expected = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);
    checksum == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    #[test]
    fn accepts_a_genuinely_encoded_auth_id() {
        let uuid = "b831381d-6324-4d53-ad4f-8cda48b30811";
        let cmd = cmd_key(uuid);
        let key = block_key(&cmd);
        let cipher = aes::Aes128::new(GenericArray::from_slice(&key));

        let mut plain = [0u8; 16];
        plain[0..4].copy_from_slice(&0x1234_5678u32.to_be_bytes());
        plain[4..12].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let checksum = crc32fast::hash(&plain[..12]);
        plain[12..16].copy_from_slice(&checksum.to_be_bytes());

        let mut block = GenericArray::clone_from_slice(&plain);
        cipher.encrypt_block(&mut block);

        assert!(try_match(uuid, &block));
    }

    #[test]
    fn rejects_random_bytes() {
        assert!(!try_match("b831381d-6324-4d53-ad4f-8cda48b30811", &[0u8; 16]));
    }

    #[test]
    fn rejects_too_short_input() {
        assert!(!try_match("b831381d-6324-4d53-ad4f-8cda48b30811", &[0u8; 8]));
    }
}

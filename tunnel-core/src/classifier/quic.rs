//! QUIC Initial-packet SNI sniffing.
//!
//! Scoped to QUICv1 only (RFC 9001): the initial secret is public (derived
//! from the destination connection ID and a version-specific constant
//! salt), so an Initial packet's CRYPTO frame — which carries the
//! ClientHello — can always be decrypted by an on-path observer. Other QUIC
//! versions (draft versions, v2) use a different salt and are treated as
//! "no match" rather than guessed at.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::Aes128Gcm;
use hkdf::Hkdf;
use sha2::Sha256;

const RFC9001_INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0x4a, 0x4c, 0x80, 0xca,
    0xdc, 0xcb, 0xb7, 0xf0,
];

fn hkdf_expand_label(secret: &[u8], label: &[u8], out_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::from_prk(secret).expect("secret is a valid PRK length");
    let mut full_label = Vec::with_capacity(6 + label.len());
    full_label.extend_from_slice(b"tls13 ");
    full_label.extend_from_slice(label);

    let mut info = Vec::new();
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push(full_label.len() as u8);
    info.extend_from_slice(&full_label);
    info.push(0); // empty context

    let mut out = vec![0u8; out_len];
    hk.expand(&info, &mut out).expect("requested length fits in SHA-256 HKDF output");
    out
}

struct InitialKeys {
    key: [u8; 16],
    iv: [u8; 12],
    hp: [u8; 16],
}

fn derive_initial_keys(dcid: &[u8]) -> InitialKeys {
    let (initial_secret, _) = Hkdf::<Sha256>::extract(Some(&RFC9001_INITIAL_SALT), dcid);

    let client_initial_secret = hkdf_expand_label(&initial_secret, b"client in", 32);
    let key_v = hkdf_expand_label(&client_initial_secret, b"quic key", 16);
    let iv_v = hkdf_expand_label(&client_initial_secret, b"quic iv", 12);
    let hp_v = hkdf_expand_label(&client_initial_secret, b"quic hp", 16);

    let mut key = [0u8; 16];
    key.copy_from_slice(&key_v);
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_v);
    let mut hp = [0u8; 16];
    hp.copy_from_slice(&hp_v);
    InitialKeys { key, iv, hp }
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let first = *buf.get(*pos)?;
    let len = 1usize << (first >> 6);
    if *pos + len > buf.len() {
        return None;
    }
    let mut value = (first & 0x3f) as u64;
    for i in 1..len {
        value = (value << 8) | buf[*pos + i] as u64;
    }
    *pos += len;
    Some(value)
}

/// Attempt to pull the SNI out of a UDP datagram carrying a QUICv1 Initial
/// packet. Returns `None` for anything that isn't a QUICv1 long-header
/// Initial, or whose CRYPTO frame doesn't start a ClientHello in the first
/// datagram (fragmented ClientHellos across multiple Initials aren't
/// reassembled — a single-datagram sniff is what the fallback chain needs).
pub fn extract_sni(datagram: &[u8]) -> Option<String> {
    if datagram.len() < 7 || datagram[0] & 0xc0 != 0xc0 {
        return None; // not a long header
    }
    let version = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    if version != 1 {
        return None;
    }
    // Initial packets use the low two type bits = 0b00.
    if (datagram[0] & 0x30) >> 4 != 0 {
        return None;
    }

    let mut pos = 5usize;
    let dcid_len = *datagram.get(pos)? as usize;
    pos += 1;
    if pos + dcid_len > datagram.len() {
        return None;
    }
    let dcid = &datagram[pos..pos + dcid_len];
    pos += dcid_len;

    let scid_len = *datagram.get(pos)? as usize;
    pos += 1 + scid_len;
    if pos > datagram.len() {
        return None;
    }

    let token_len = read_varint(datagram, &mut pos)? as usize;
    pos += token_len;
    if pos > datagram.len() {
        return None;
    }

    let payload_len = read_varint(datagram, &mut pos)? as usize;
    let pn_offset = pos;
    if pn_offset + payload_len > datagram.len() || payload_len < 4 {
        return None;
    }

    let keys = derive_initial_keys(dcid);

    // Header protection: sample starts 4 bytes after the (unknown-length)
    // packet number field begins.
    if pn_offset + 4 + 16 > datagram.len() {
        return None;
    }
    let sample = &datagram[pn_offset + 4..pn_offset + 4 + 16];
    let hp_cipher = aes::Aes128::new(GenericArray::from_slice(&keys.hp));
    let mut mask_block = GenericArray::clone_from_slice(sample);
    hp_cipher.encrypt_block(&mut mask_block);
    let mask = mask_block;

    let mut first_byte = datagram[0];
    first_byte ^= mask[0] & 0x0f;
    let pn_len = (first_byte & 0x03) as usize + 1;

    let mut pn_bytes = datagram[pn_offset..pn_offset + pn_len].to_vec();
    for (i, b) in pn_bytes.iter_mut().enumerate() {
        *b ^= mask[1 + i];
    }
    let mut packet_number: u64 = 0;
    for b in &pn_bytes {
        packet_number = (packet_number << 8) | *b as u64;
    }

    let payload_offset = pn_offset + pn_len;
    let payload_end = pn_offset + payload_len;
    if payload_offset >= payload_end || payload_end > datagram.len() {
        return None;
    }
    let ciphertext = &datagram[payload_offset..payload_end];

    let mut nonce = keys.iv;
    let pn_be = packet_number.to_be_bytes();
    for i in 0..8 {
        nonce[4 + i] ^= pn_be[i];
    }

    // AAD is the reconstructed (unprotected) header.
    let mut aad = datagram[..pn_offset].to_vec();
    aad[0] = first_byte;
    aad.extend_from_slice(&pn_bytes);

    let cipher = Aes128Gcm::new_from_slice(&keys.key).ok()?;
    let plaintext = cipher
        .decrypt(&nonce.into(), Payload { msg: ciphertext, aad: &aad })
        .ok()?;

    extract_sni_from_crypto_frames(&plaintext)
}

/// Walk the decrypted Initial payload's frames looking for a CRYPTO frame,
/// then hand its contents (a TLS handshake fragment, not a full record) to
/// the ClientHello SNI walker.
fn extract_sni_from_crypto_frames(plaintext: &[u8]) -> Option<String> {
    let mut pos = 0usize;
    while pos < plaintext.len() {
        let frame_type = plaintext[pos];
        match frame_type {
            0x00 => {
                pos += 1; // PADDING
            }
            0x06 => {
                pos += 1;
                let _offset = read_varint(plaintext, &mut pos)?;
                let length = read_varint(plaintext, &mut pos)? as usize;
                if pos + length > plaintext.len() {
                    return None;
                }
                let crypto = &plaintext[pos..pos + length];
                return crate::classifier::tls_sni::extract_sni_from_handshake_body(crypto);
            }
            _ => return None, // any other frame in the first Initial: give up
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_header_packets() {
        assert_eq!(extract_sni(&[0x40, 1, 2, 3]), None);
    }

    #[test]
    fn rejects_non_v1_versions() {
        let mut datagram = vec![0xc3, 0xff, 0x00, 0x00, 0x1d];
        datagram.extend_from_slice(&[0u8; 20]);
        assert_eq!(extract_sni(&datagram), None);
    }
}

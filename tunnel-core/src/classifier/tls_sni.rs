//! SNI extraction from a raw TLS ClientHello, ported from the teacher's
//! `extract_sni_fast` (`router-core/src/app/proxy.rs`) byte-walk almost
//! unchanged — it already does exactly what the classifier needs.

pub fn extract_sni(buf: &[u8]) -> Option<String> {
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    extract_sni_from_handshake_body(&buf[5..])
}

/// Same walk as `extract_sni`, but starting at the handshake-message byte
/// (type + 3-byte length) rather than after a 5-byte TLS record header.
/// QUIC's CRYPTO frames carry handshake messages directly, with no record
/// layer wrapping them.
pub fn extract_sni_from_handshake_body(buf: &[u8]) -> Option<String> {
    let mut pos = 0;
    if pos + 4 > buf.len() {
        return None;
    }
    pos += 4; // handshake type + length

    if pos + 2 > buf.len() {
        return None;
    }
    pos += 2; // client version

    if pos + 32 > buf.len() {
        return None;
    }
    pos += 32; // client random

    if pos + 1 > buf.len() {
        return None;
    }
    let session_id_len = buf[pos] as usize;
    pos += 1;
    if pos + session_id_len > buf.len() {
        return None;
    }
    pos += session_id_len;

    if pos + 2 > buf.len() {
        return None;
    }
    let cipher_suites_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    if pos + cipher_suites_len > buf.len() {
        return None;
    }
    pos += cipher_suites_len;

    if pos + 1 > buf.len() {
        return None;
    }
    let compression_methods_len = buf[pos] as usize;
    pos += 1;
    if pos + compression_methods_len > buf.len() {
        return None;
    }
    pos += compression_methods_len;

    if pos + 2 > buf.len() {
        return None;
    }
    let extensions_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
    pos += 2;
    if pos + extensions_len > buf.len() {
        return None;
    }

    let extensions_end = pos + extensions_len;
    while pos + 4 <= extensions_end {
        let ext_type = ((buf[pos] as u16) << 8) | (buf[pos + 1] as u16);
        let ext_len = ((buf[pos + 2] as usize) << 8) | (buf[pos + 3] as usize);
        pos += 4;

        if pos + ext_len > extensions_end {
            break;
        }

        if ext_type == 0 {
            if ext_len >= 2 {
                let sni_list_len = ((buf[pos] as usize) << 8) | (buf[pos + 1] as usize);
                let list_start = pos + 2;
                if list_start + sni_list_len <= extensions_end && sni_list_len >= 3 && buf[list_start] == 0 {
                    let hostname_len =
                        ((buf[list_start + 1] as usize) << 8) | (buf[list_start + 2] as usize);
                    let name_start = list_start + 3;
                    if name_start + hostname_len <= extensions_end {
                        return std::str::from_utf8(&buf[name_start..name_start + hostname_len])
                            .ok()
                            .map(str::to_string);
                    }
                }
            }
            break;
        }

        pos += ext_len;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(sni: &str) -> Vec<u8> {
        let mut ext = vec![0u8, 0u8]; // SNI extension type 0
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
        body.extend_from_slice(&[3, 3]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&[0, 2]); // cipher suites len
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods len
        body.push(0);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![1u8]; // ClientHello
        handshake.extend_from_slice(&((body.len() as u32).to_be_bytes()[1..]));
        handshake.extend_from_slice(&body);

        // record-layer version is pinned to {3, 1} regardless of the
        // handshake's own negotiated version, per real ClientHello wire
        // framing (and what `classifier::is_tls_client_hello` checks for).
        let mut record = vec![0x16, 3, 1];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_synthetic_client_hello() {
        let hello = build_client_hello("example.com");
        assert_eq!(extract_sni(&hello).as_deref(), Some("example.com"));
    }

    #[test]
    fn returns_none_for_non_tls() {
        assert_eq!(extract_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
    }
}

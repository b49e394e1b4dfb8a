//! Ambient: the `generate-secret` helper behind the CLI's
//! `generate-secret <mode|hostname>` form. Grounded in the MTProto
//! hex-secret format described alongside `mtproto_protocol.rs`'s FakeTLS
//! handshake: a bare 16-byte secret is "simple", `0xdd` + 16 bytes is
//! "secured", and `0xee` + 16 bytes + a hostname is a FakeTLS cloak secret.

use rand::RngCore;

/// `mode` is `"simple"` or `"secured"`; any other token is treated as the
/// FakeTLS cloak hostname and produces an `0xee`-tagged secret.
pub fn generate(mode_or_hostname: &str) -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);

    match mode_or_hostname {
        "simple" => hex::encode(key),
        "secured" => {
            let mut out = Vec::with_capacity(17);
            out.push(0xdd);
            out.extend_from_slice(&key);
            hex::encode(out)
        }
        hostname => {
            let mut out = Vec::with_capacity(17 + hostname.len());
            out.push(0xee);
            out.extend_from_slice(&key);
            out.extend_from_slice(hostname.as_bytes());
            hex::encode(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_mode_is_sixteen_bytes() {
        let secret = generate("simple");
        assert_eq!(hex::decode(secret).unwrap().len(), 16);
    }

    #[test]
    fn secured_mode_is_tagged() {
        let secret = generate("secured");
        let raw = hex::decode(secret).unwrap();
        assert_eq!(raw.len(), 17);
        assert_eq!(raw[0], 0xdd);
    }

    #[test]
    fn hostname_is_faketls_tagged_and_appended() {
        let secret = generate("example.com");
        let raw = hex::decode(secret).unwrap();
        assert_eq!(raw[0], 0xee);
        assert_eq!(&raw[17..], b"example.com");
    }
}

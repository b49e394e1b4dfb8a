//! Component L: 0-RTT early data carried in the `Sec-WebSocket-Protocol`
//! header of the WS upgrade request, base64url-encoded with no padding —
//! the same convention v2ray/Xray clients use so a single round trip can
//! both upgrade the connection and deliver the first application bytes.

use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};

pub fn encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn decode(protocol_header: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(protocol_header.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let data = b"hello early data \x00\x01\xff";
        let encoded = encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(decode(&encoded).unwrap(), data);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not base64!!").is_none());
    }
}

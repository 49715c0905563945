//! Message framing for the tunnel protocol.
//!
//! Every binary WebSocket message, in both directions, is a 4-character ASCII
//! hex identifier followed by an opaque payload:
//!
//! ```text
//! [4 ASCII hex chars (16-bit id)][payload bytes until end of frame]
//! ```
//!
//! Request ids are assigned by the backend; response ids come from a counter
//! owned by the response pump and are not correlated with request ids.

use thiserror::Error;

/// Width of the id field in bytes.
const ID_LEN: usize = 4;

/// Errors produced while decoding an inbound request frame. Any of these is
/// fatal to the active session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes is too short to carry an id")]
    Truncated(usize),
    #[error("frame id is not 4 ASCII hex characters")]
    BadId,
}

/// Split an inbound frame into its request id and payload.
pub fn decode_request(frame: &[u8]) -> Result<(u16, &[u8]), FrameError> {
    if frame.len() < ID_LEN {
        return Err(FrameError::Truncated(frame.len()));
    }
    let (head, payload) = frame.split_at(ID_LEN);
    if !head.iter().all(u8::is_ascii_hexdigit) {
        return Err(FrameError::BadId);
    }
    // from_utf8 cannot fail on ASCII hex digits
    let head = std::str::from_utf8(head).map_err(|_| FrameError::BadId)?;
    let id = u16::from_str_radix(head, 16).map_err(|_| FrameError::BadId)?;
    Ok((id, payload))
}

/// Build an outbound response frame: lowercase zero-padded hex id, then the
/// payload verbatim.
#[must_use]
pub fn encode_response(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ID_LEN + payload.len());
    frame.extend_from_slice(format!("{id:04x}").as_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_request_with_payload() {
        let (id, payload) = decode_request(b"0001GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(id, 1);
        assert_eq!(payload, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn decodes_empty_payload() {
        let (id, payload) = decode_request(b"002a").unwrap();
        assert_eq!(id, 0x2a);
        assert!(payload.is_empty());
    }

    #[test]
    fn rejects_short_frame() {
        assert_eq!(decode_request(b"00"), Err(FrameError::Truncated(2)));
        assert_eq!(decode_request(b""), Err(FrameError::Truncated(0)));
    }

    #[test]
    fn rejects_non_hex_id() {
        assert_eq!(decode_request(b"00g1data"), Err(FrameError::BadId));
        assert_eq!(decode_request(b"+123data"), Err(FrameError::BadId));
    }

    #[test]
    fn encodes_lowercase_zero_padded_id() {
        assert_eq!(encode_response(0, b"OK"), b"0000OK");
        assert_eq!(encode_response(0xbeef, b""), b"beef");
        assert_eq!(encode_response(10, b"x"), b"000ax");
    }

    #[test]
    fn roundtrip_across_id_range() {
        for id in [0u16, 1, 0x2a, 0x0100, 0xfffe, 0xffff] {
            let payload = vec![0u8, 1, 2, 0xff];
            let frame = encode_response(id, &payload);
            let (decoded, body) = decode_request(&frame).unwrap();
            assert_eq!(decoded, id);
            assert_eq!(body, payload.as_slice());
        }
    }
}

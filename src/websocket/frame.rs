//! RFC 6455 frame primitives
//!
//! Client-side frame encoding (always masked, shortest legal length form)
//! plus the constants and checks shared with the decoder.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha1::{Digest, Sha1};

/// Appended to the client key when computing `Sec-WebSocket-Accept`
pub(crate) const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close reasons leave room for the 2-byte status code
pub(crate) const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub(crate) fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub(crate) fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub(crate) fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Close codes a frame may legally carry. 1005/1006/1015 are report-only
/// by definition; 1004/1010 and 1016-2999 are reserved.
pub(crate) fn is_legal_close_code(code: u16) -> bool {
    match code {
        0..=999 => false,
        1004 | 1005 | 1006 | 1010 | 1015 => false,
        1016..=2999 => false,
        _ => true,
    }
}

/// Fresh masking key. All-zero draws are kept: a zero key is a legal key,
/// the payload just happens to travel unchanged.
pub(crate) fn mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// XOR the payload with the repeating 4-byte key, eight bytes at a time
/// with a scalar tail. XOR is its own inverse, so this both masks and
/// unmasks.
pub(crate) fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    let mut word = [0u8; 8];
    word[..4].copy_from_slice(&key);
    word[4..].copy_from_slice(&key);

    let mut chunks = payload.chunks_exact_mut(8);
    for chunk in &mut chunks {
        for (byte, mask) in chunk.iter_mut().zip(word) {
            *byte ^= mask;
        }
    }
    for (byte, mask) in chunks.into_remainder().iter_mut().zip(word) {
        *byte ^= mask;
    }
}

/// Encode one client frame with a fresh mask
pub(crate) fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
    encode_frame_with_key(opcode, payload, fin, mask_key())
}

pub(crate) fn encode_frame_with_key(
    opcode: Opcode,
    payload: &[u8],
    fin: bool,
    key: [u8; 4],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    let first = if fin { 0x80 | opcode.bits() } else { opcode.bits() };
    frame.push(first);

    // Shortest legal length form; 0x80 marks the frame as masked
    match payload.len() {
        len @ 0..=125 => frame.push(0x80 | len as u8),
        len @ 126..=65535 => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    frame.extend_from_slice(&key);
    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], key);
    frame
}

/// Encode a close frame: 2-byte code plus a UTF-8 reason, truncated at a
/// character boundary to fit the control-frame limit.
pub(crate) fn encode_close(code: u16, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut payload = Vec::with_capacity(end + 2);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    encode_frame(Opcode::Close, &payload, true)
}

/// Random 16-byte key for the upgrade request, base64-encoded
pub(crate) fn client_key() -> String {
    let mut key = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key);
    BASE64.encode(key)
}

/// The `Sec-WebSocket-Accept` value a compliant server must answer with
pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(ACCEPT_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_the_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn masking_is_its_own_inverse() {
        let original: Vec<u8> = (0u8..=255).cycle().take(1027).collect();
        for key in [[0u8; 4], [0x12, 0x34, 0x56, 0x78], [0xFF, 0x00, 0xFF, 0x00]] {
            let mut masked = original.clone();
            apply_mask(&mut masked, key);
            apply_mask(&mut masked, key);
            assert_eq!(masked, original, "key {key:?}");
        }
    }

    #[test]
    fn zero_mask_leaves_the_payload_unchanged() {
        let mut payload = b"plainly visible".to_vec();
        apply_mask(&mut payload, [0u8; 4]);
        assert_eq!(payload, b"plainly visible");
    }

    #[test]
    fn length_encoding_uses_the_shortest_form() {
        let frame = encode_frame_with_key(Opcode::Binary, &[0u8; 125], true, [0; 4]);
        assert_eq!(frame[1], 0x80 | 125);

        let frame = encode_frame_with_key(Opcode::Binary, &[0u8; 126], true, [0; 4]);
        assert_eq!(frame[1], 0x80 | 126);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 126);

        let frame = encode_frame_with_key(Opcode::Binary, &[0u8; 65536], true, [0; 4]);
        assert_eq!(frame[1], 0x80 | 127);
        assert_eq!(
            u64::from_be_bytes([
                frame[2], frame[3], frame[4], frame[5], frame[6], frame[7], frame[8], frame[9]
            ]),
            65536
        );
    }

    #[test]
    fn fin_and_opcode_land_in_the_first_byte() {
        let frame = encode_frame_with_key(Opcode::Text, b"hi", true, [0; 4]);
        assert_eq!(frame[0], 0x81);
        let frame = encode_frame_with_key(Opcode::Text, b"hi", false, [0; 4]);
        assert_eq!(frame[0], 0x01);
    }

    #[test]
    fn close_codes_follow_the_reserved_ranges() {
        for code in [1000, 1001, 1002, 1003, 1007, 1011, 3000, 4999, 65535] {
            assert!(is_legal_close_code(code), "{code} should be legal");
        }
        for code in [0, 999, 1004, 1005, 1006, 1010, 1015, 1016, 2500, 2999] {
            assert!(!is_legal_close_code(code), "{code} should be illegal");
        }
    }

    #[test]
    fn close_reason_is_truncated_to_fit_a_control_frame() {
        let reason = "x".repeat(500);
        let frame = encode_close(1000, &reason);
        // 2 header bytes + 4 mask bytes + code + truncated reason
        assert_eq!(frame.len(), 2 + 4 + 2 + MAX_CLOSE_REASON);
        assert_eq!(frame[1] & 0x7F, (2 + MAX_CLOSE_REASON) as u8);
    }

    #[test]
    fn client_keys_are_random_16_byte_tokens() {
        let one = client_key();
        let two = client_key();
        assert_eq!(one.len(), 24);
        assert_ne!(one, two);
        assert_eq!(BASE64.decode(&one).unwrap().len(), 16);
    }
}

//! Frame encoding/decoding
//!
//! Frame format:
//! - 3 bytes: magic `CM>` (0x43 0x4D 0x3E)
//! - 2 bytes: length of everything after this field (big-endian)
//! - 2 bytes: command code (big-endian)
//! - N bytes: params (requests), type + status (control replies) or data (DATA replies)
//! - 1 byte: CRC, XOR of the command code and body bytes
//!
//! Replies carry no explicit DATA tag. A payload of exactly 6 bytes is a
//! control frame (ACK/DONE/NACK); anything longer is DATA.

use std::fmt::Write as _;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::{DeviceStatus, FramingError, CONTROL_PAYLOAD_LEN, HEADER_LEN, MAGIC, MAX_PARAMS_LEN};

/// Type byte the controller writes at the start of a DATA body
pub const DATA_ENVELOPE_TYPE: u8 = 0x03;

/// Size of the DATA envelope: type marker + 2-byte status
pub const DATA_ENVELOPE_LEN: usize = 3;

/// Reply classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Command received, execution started (type 0x01)
    Ack,
    /// Command finished with a status (type 0x02)
    Done,
    /// Command refused or failed (type 0x04)
    Nack,
    /// Variable-length result, inferred from payload length
    Data,
    /// Control frame with a type byte the host does not know
    Other(u8),
}

impl FrameKind {
    /// Classify the type byte of a fixed-size frame
    pub fn from_type_byte(byte: u8) -> Self {
        match byte {
            0x01 => FrameKind::Ack,
            0x02 => FrameKind::Done,
            0x04 => FrameKind::Nack,
            other => FrameKind::Other(other),
        }
    }

    /// Type byte written on the wire for this kind
    pub fn type_byte(self) -> u8 {
        match self {
            FrameKind::Ack => 0x01,
            FrameKind::Done => 0x02,
            FrameKind::Data => DATA_ENVELOPE_TYPE,
            FrameKind::Nack => 0x04,
            FrameKind::Other(byte) => byte,
        }
    }
}

/// How the controller lays out the body of a DATA frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLayout {
    /// Body starts with a 3-byte envelope (type 0x03 + status) before the result
    #[default]
    Enveloped,
    /// Body is the result as-is
    Raw,
}

impl DataLayout {
    /// Extract the result bytes from a DATA body
    pub fn result<'a>(self, data: &'a [u8]) -> Option<&'a [u8]> {
        match self {
            DataLayout::Raw => Some(data),
            DataLayout::Enveloped => data.get(DATA_ENVELOPE_LEN..),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command_code: u16,
    kind: FrameKind,
    payload: Vec<u8>,
    raw: Vec<u8>,
}

impl Frame {
    /// Command this frame answers
    pub fn command_code(&self) -> u16 {
        self.command_code
    }

    /// Control type, or DATA
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Status bytes for control frames, data bytes for DATA frames
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Exact wire bytes, magic through CRC
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Big-endian status of a control frame
    pub fn status(&self) -> Option<u16> {
        if self.kind == FrameKind::Data {
            return None;
        }
        Some(BigEndian::read_u16(&self.payload))
    }

    /// Status of a control frame as a [`DeviceStatus`]
    pub fn device_status(&self) -> Option<DeviceStatus> {
        self.status().map(DeviceStatus::from)
    }

    /// Data bytes of a DATA frame
    pub fn data(&self) -> Option<&[u8]> {
        (self.kind == FrameKind::Data).then_some(self.payload.as_slice())
    }

    /// Type marker and status from the DATA envelope, if the body is long enough
    pub fn data_envelope(&self) -> Option<(u8, u16)> {
        let data = self.data()?;
        if data.len() < DATA_ENVELOPE_LEN {
            return None;
        }
        Some((data[0], BigEndian::read_u16(&data[1..3])))
    }

    /// True when the frame answers `command_code` with the given kind
    pub fn matches(&self, command_code: u16, kind: FrameKind) -> bool {
        self.command_code == command_code && self.kind == kind
    }
}

/// Result of trying to cut one frame off the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// More bytes are needed before anything can be decided
    Incomplete,
    /// Malformed frame; the caller drops `consumed` bytes and resumes scanning
    Invalid {
        reason: FramingError,
        consumed: usize,
    },
    /// A complete, CRC-checked frame occupying `consumed` bytes
    Complete { frame: Frame, consumed: usize },
}

/// XOR of every byte
pub fn xor_crc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |crc, b| crc ^ b)
}

/// Encode a command frame
pub fn encode(command_code: u16, params: &[u8]) -> Result<Vec<u8>, FramingError> {
    if params.len() > MAX_PARAMS_LEN {
        return Err(FramingError::Oversized {
            len: params.len(),
            max: MAX_PARAMS_LEN,
        });
    }

    // Command code + params + CRC
    let length = 2 + params.len() + 1;
    let mut bytes = Vec::with_capacity(HEADER_LEN + length);
    bytes.extend_from_slice(&MAGIC);

    let mut word = [0u8; 2];
    BigEndian::write_u16(&mut word, length as u16);
    bytes.extend_from_slice(&word);

    BigEndian::write_u16(&mut word, command_code);
    bytes.extend_from_slice(&word);
    bytes.extend_from_slice(params);

    let crc = xor_crc(&bytes[HEADER_LEN..]);
    bytes.push(crc);

    Ok(bytes)
}

/// Encode a fixed-size control reply (ACK/DONE/NACK)
pub fn encode_control(command_code: u16, kind: FrameKind, status: u16) -> Vec<u8> {
    let mut body = [kind.type_byte(), 0, 0];
    BigEndian::write_u16(&mut body[1..], status);
    // Three bytes never exceed the length field
    encode(command_code, &body).unwrap_or_default()
}

/// Encode an enveloped DATA reply the way the controller sends it.
///
/// An empty `result` produces a 6-byte payload, which decodes as a control
/// frame; DATA replies always carry at least one result byte.
pub fn encode_data(command_code: u16, status: u16, result: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut body = Vec::with_capacity(DATA_ENVELOPE_LEN + result.len());
    body.push(DATA_ENVELOPE_TYPE);
    let mut word = [0u8; 2];
    BigEndian::write_u16(&mut word, status);
    body.extend_from_slice(&word);
    body.extend_from_slice(result);
    encode(command_code, &body)
}

/// Try to decode the frame at the start of `buffer`.
///
/// The buffer must begin with the magic anchor; the reassembler guarantees
/// this by cutting off any text in front of it first.
pub fn try_decode(buffer: &[u8]) -> DecodeOutcome {
    if buffer.len() < MAGIC.len() {
        if MAGIC.starts_with(buffer) {
            return DecodeOutcome::Incomplete;
        }
        return DecodeOutcome::Invalid {
            reason: FramingError::Misaligned,
            consumed: 1,
        };
    }
    if buffer[..MAGIC.len()] != MAGIC {
        return DecodeOutcome::Invalid {
            reason: FramingError::Misaligned,
            consumed: 1,
        };
    }

    if buffer.len() < HEADER_LEN {
        return DecodeOutcome::Incomplete;
    }

    let payload_len = BigEndian::read_u16(&buffer[3..HEADER_LEN]) as usize;
    let total = HEADER_LEN + payload_len;
    if buffer.len() < total {
        return DecodeOutcome::Incomplete;
    }

    // Length field is trusted even when the rest is garbage
    if payload_len < CONTROL_PAYLOAD_LEN {
        return DecodeOutcome::Invalid {
            reason: FramingError::TooShort { payload_len },
            consumed: total,
        };
    }

    let payload = &buffer[HEADER_LEN..total];
    let received = payload[payload_len - 1];
    let calculated = xor_crc(&payload[..payload_len - 1]);
    if received != calculated {
        return DecodeOutcome::Invalid {
            reason: FramingError::CrcMismatch {
                expected: calculated,
                actual: received,
            },
            consumed: total,
        };
    }

    let command_code = BigEndian::read_u16(&payload[0..2]);
    let (kind, body) = if payload_len == CONTROL_PAYLOAD_LEN {
        (FrameKind::from_type_byte(payload[2]), &payload[3..5])
    } else {
        (FrameKind::Data, &payload[2..payload_len - 1])
    };

    DecodeOutcome::Complete {
        frame: Frame {
            command_code,
            kind,
            payload: body.to_vec(),
            raw: buffer[..total].to_vec(),
        },
        consumed: total,
    }
}

/// Space-separated lowercase hex, e.g. `43 4d 3e`
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn decode_complete(bytes: &[u8]) -> (Frame, usize) {
        match try_decode(bytes) {
            DecodeOutcome::Complete { frame, consumed } => (frame, consumed),
            other => panic!("Expected a complete frame, got {:?}", other),
        }
    }

    #[test]
    fn test_init_command_bytes() {
        let encoded = encode(0x1002, &[0x01]).unwrap();
        // CRC = 0x10 ^ 0x02 ^ 0x01
        assert_eq!(encoded, vec![0x43, 0x4d, 0x3e, 0x00, 0x04, 0x10, 0x02, 0x01, 0x13]);
    }

    #[test]
    fn test_init_all_modules_bytes() {
        let encoded = encode(0x1002, &[0xff]).unwrap();
        assert_eq!(hex_dump(&encoded), "43 4d 3e 00 04 10 02 ff ed");
    }

    #[test]
    fn test_command_without_params() {
        let encoded = encode(0x1000, &[]).unwrap();
        assert_eq!(encoded, vec![0x43, 0x4d, 0x3e, 0x00, 0x03, 0x10, 0x00, 0x10]);
    }

    #[test]
    fn test_oversized_params_rejected() {
        let params = vec![0u8; MAX_PARAMS_LEN + 1];
        assert_eq!(
            encode(0x2000, &params),
            Err(FramingError::Oversized {
                len: MAX_PARAMS_LEN + 1,
                max: MAX_PARAMS_LEN
            })
        );
    }

    #[test]
    fn test_decode_ack() {
        let bytes = encode_control(0x1002, FrameKind::Ack, 0x0000);
        let (frame, consumed) = decode_complete(&bytes);

        assert_eq!(consumed, 11);
        assert_eq!(frame.command_code(), 0x1002);
        assert_eq!(frame.kind(), FrameKind::Ack);
        assert_eq!(frame.status(), Some(0));
        assert_eq!(frame.data(), None);
        assert_eq!(frame.raw_bytes(), bytes.as_slice());
    }

    #[test]
    fn test_decode_nack_status() {
        let bytes = encode_control(0x4000, FrameKind::Nack, 0x0001);
        let (frame, _) = decode_complete(&bytes);
        assert_eq!(frame.kind(), FrameKind::Nack);
        assert_eq!(frame.device_status(), Some(DeviceStatus::UnknownCommand));
    }

    #[test]
    fn test_decode_unknown_type_byte() {
        let bytes = encode(0x1002, &[0x09, 0x00, 0x07]).unwrap();
        let (frame, _) = decode_complete(&bytes);
        assert_eq!(frame.kind(), FrameKind::Other(0x09));
        assert_eq!(frame.status(), Some(7));
    }

    #[test]
    fn test_decode_data_frame() {
        let bytes = encode_data(0x1000, 0x0000, &[0x02, 0x00, 0x00]).unwrap();
        let (frame, consumed) = decode_complete(&bytes);

        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.kind(), FrameKind::Data);
        assert_eq!(frame.data(), Some(&[0x03, 0x00, 0x00, 0x02, 0x00, 0x00][..]));
        assert_eq!(frame.data_envelope(), Some((0x03, 0x0000)));
        assert_eq!(frame.status(), None);
        assert_eq!(
            DataLayout::Enveloped.result(frame.payload()),
            Some(&[0x02, 0x00, 0x00][..])
        );
        assert_eq!(DataLayout::Raw.result(frame.payload()).map(<[u8]>::len), Some(6));
    }

    #[test]
    fn test_length_field_matches_raw() {
        let bytes = encode_data(0x3000, 0, &[1, 2, 3, 4, 5, 6, 7]).unwrap();
        let (frame, _) = decode_complete(&bytes);
        let raw = frame.raw_bytes();
        assert_eq!(&raw[..3], &MAGIC);
        assert_eq!(BigEndian::read_u16(&raw[3..5]) as usize, raw.len() - 5);
    }

    #[test]
    fn test_incomplete_header_and_body() {
        let bytes = encode_control(0x1002, FrameKind::Done, 0);
        for cut in 0..bytes.len() {
            assert_eq!(try_decode(&bytes[..cut]), DecodeOutcome::Incomplete, "cut at {}", cut);
        }
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let mut bytes = encode_control(0x1002, FrameKind::Ack, 0);
        let frame_len = bytes.len();
        bytes.extend_from_slice(b"tail");
        let (_, consumed) = decode_complete(&bytes);
        assert_eq!(consumed, frame_len);
    }

    #[test]
    fn test_too_short_payload() {
        // Request frames from the host side are shorter than any reply
        let bytes = encode(0x1002, &[0x01]).unwrap();
        assert_eq!(
            try_decode(&bytes),
            DecodeOutcome::Invalid {
                reason: FramingError::TooShort { payload_len: 4 },
                consumed: 9,
            }
        );
    }

    #[test]
    fn test_crc_verification() {
        let mut bytes = encode_control(0x1002, FrameKind::Done, 0x0000);
        // Corrupt the status
        bytes[9] ^= 0x01;

        match try_decode(&bytes) {
            DecodeOutcome::Invalid {
                reason: FramingError::CrcMismatch { .. },
                consumed,
            } => assert_eq!(consumed, bytes.len()),
            other => panic!("Expected CRC mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_misaligned_buffer() {
        assert_eq!(
            try_decode(b"xCM>"),
            DecodeOutcome::Invalid {
                reason: FramingError::Misaligned,
                consumed: 1,
            }
        );
        assert_eq!(try_decode(b"CM"), DecodeOutcome::Incomplete);
    }

    #[test]
    fn test_type_byte_mapping() {
        for kind in [FrameKind::Ack, FrameKind::Done, FrameKind::Nack] {
            assert_eq!(FrameKind::from_type_byte(kind.type_byte()), kind);
        }
        assert_eq!(FrameKind::from_type_byte(0x03), FrameKind::Other(0x03));
    }
}

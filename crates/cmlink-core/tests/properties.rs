//! Property-based checks for the frame codec and stream reassembly.

use cmlink_core::protocol::{
    encode, encode_control, encode_data, try_decode, DecodeOutcome, FrameKind, FramingError,
    Message, StreamReassembler,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Chunk {
    Line(String),
    Control(u16, u8, u16),
    Data(u16, Vec<u8>),
}

impl Chunk {
    fn bytes(&self) -> Vec<u8> {
        match self {
            Chunk::Line(text) => format!("{}\n", text).into_bytes(),
            Chunk::Control(code, type_byte, status) => {
                encode_control(*code, FrameKind::from_type_byte(*type_byte), *status)
            }
            Chunk::Data(code, result) => encode_data(*code, 0, result).unwrap(),
        }
    }
}

fn chunk_strategy() -> impl Strategy<Value = Chunk> {
    prop_oneof![
        "[a-z][a-z0-9 :]{0,30}".prop_map(Chunk::Line),
        (any::<u16>(), 1u8..=4, any::<u16>()).prop_map(|(c, t, s)| Chunk::Control(c, t, s)),
        (any::<u16>(), prop::collection::vec(any::<u8>(), 0..40))
            .prop_map(|(c, r)| Chunk::Data(c, r)),
    ]
}

fn reassemble(stream: &[u8], cuts: &[usize]) -> Vec<Message> {
    let mut reassembler = StreamReassembler::new();
    let mut messages = Vec::new();
    let mut start = 0;
    for &cut in cuts {
        let end = cut.clamp(start, stream.len());
        messages.extend(reassembler.push(&stream[start..end]));
        start = end;
    }
    messages.extend(reassembler.push(&stream[start..]));
    messages
}

proptest! {
    #[test]
    fn prop_roundtrip_data(code in any::<u16>(), params in prop::collection::vec(any::<u8>(), 4..=255)) {
        let bytes = encode(code, &params).unwrap();
        match try_decode(&bytes) {
            DecodeOutcome::Complete { frame, consumed } => {
                prop_assert_eq!(consumed, bytes.len());
                prop_assert_eq!(frame.command_code(), code);
                prop_assert_eq!(frame.kind(), FrameKind::Data);
                prop_assert_eq!(frame.data(), Some(&params[..]));
            }
            other => prop_assert!(false, "expected frame, got {:?}", other),
        }
    }

    #[test]
    fn prop_roundtrip_control(code in any::<u16>(), params in prop::array::uniform3(any::<u8>())) {
        let bytes = encode(code, &params).unwrap();
        match try_decode(&bytes) {
            DecodeOutcome::Complete { frame, .. } => {
                prop_assert_eq!(frame.command_code(), code);
                prop_assert_eq!(frame.kind(), FrameKind::from_type_byte(params[0]));
                prop_assert_eq!(frame.status(), Some(u16::from_be_bytes([params[1], params[2]])));
            }
            other => prop_assert!(false, "expected frame, got {:?}", other),
        }
    }

    #[test]
    fn prop_short_params_too_short(code in any::<u16>(), params in prop::collection::vec(any::<u8>(), 0..=2)) {
        let bytes = encode(code, &params).unwrap();
        match try_decode(&bytes) {
            DecodeOutcome::Invalid { reason: FramingError::TooShort { .. }, consumed } => {
                prop_assert_eq!(consumed, bytes.len());
            }
            other => prop_assert!(false, "expected TooShort, got {:?}", other),
        }
    }

    #[test]
    fn prop_bit_flip_is_crc_mismatch(
        code in any::<u16>(),
        params in prop::collection::vec(any::<u8>(), 3..64),
        pick in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut bytes = encode(code, &params).unwrap();
        // Any byte covered by the CRC, or the CRC itself
        let index = 5 + pick.index(bytes.len() - 5);
        bytes[index] ^= 1 << bit;

        match try_decode(&bytes) {
            DecodeOutcome::Invalid { reason: FramingError::CrcMismatch { .. }, consumed } => {
                prop_assert_eq!(consumed, bytes.len());
            }
            other => prop_assert!(false, "expected CrcMismatch, got {:?}", other),
        }
    }

    #[test]
    fn prop_chunking_does_not_change_messages(
        chunks in prop::collection::vec(chunk_strategy(), 1..12),
        cuts in prop::collection::vec(any::<usize>(), 0..20),
    ) {
        let stream: Vec<u8> = chunks.iter().flat_map(Chunk::bytes).collect();
        let mut cuts = cuts;
        for cut in cuts.iter_mut() {
            *cut %= stream.len() + 1;
        }
        cuts.sort_unstable();

        let whole = reassemble(&stream, &[]);
        prop_assert_eq!(whole.len(), chunks.len());
        prop_assert_eq!(reassemble(&stream, &cuts), whole.clone());

        let one_byte: Vec<usize> = (1..stream.len()).collect();
        prop_assert_eq!(reassemble(&stream, &one_byte), whole);
    }
}

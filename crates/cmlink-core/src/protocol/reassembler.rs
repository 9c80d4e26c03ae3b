//! Stream reassembly
//!
//! Splits the raw byte stream coming from the controller into diagnostic text
//! and binary frames, in arrival order. Frames may be split across reads,
//! several may arrive in one read, and the firmware's debug prints land
//! between them.

use tracing::{debug, warn};

use super::frame::{hex_dump, try_decode, DecodeOutcome, Frame};
use super::{FramingError, DEFAULT_MAX_LINE_LEN, MAGIC};

/// One classified unit of the incoming stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Free-form text printed by the controller, trimmed
    Text(String),
    /// A complete, CRC-checked frame
    Binary(Frame),
}

impl Message {
    /// The frame, if this is a binary message
    pub fn frame(&self) -> Option<&Frame> {
        match self {
            Message::Binary(frame) => Some(frame),
            Message::Text(_) => None,
        }
    }

    /// Human-readable one-liner for logs and the console
    pub fn describe(&self) -> String {
        match self {
            Message::Text(text) => text.clone(),
            Message::Binary(frame) => format!(
                "{:?} for {:#06x}: {}",
                frame.kind(),
                frame.command_code(),
                hex_dump(frame.raw_bytes())
            ),
        }
    }
}

/// Counters kept by the reassembler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Bytes fed in
    pub bytes_in: u64,
    /// Frames emitted
    pub frames: u64,
    /// Text messages emitted
    pub text_messages: u64,
    /// Frames dropped on CRC mismatch
    pub crc_errors: u64,
    /// Frames dropped because the declared payload was too short
    pub short_frames: u64,
    /// Bytes thrown away with malformed frames
    pub bytes_discarded: u64,
}

/// Accumulates bytes and cuts messages off the front of the buffer
#[derive(Debug)]
pub struct StreamReassembler {
    buffer: Vec<u8>,
    max_line_len: usize,
    stats: ReassemblerStats,
}

impl StreamReassembler {
    /// Reassembler with the default line limit
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create a reassembler that flushes unterminated text past `max_line_len` bytes
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            max_line_len: max_line_len.max(MAGIC.len()),
            stats: ReassemblerStats::default(),
        }
    }

    /// Append bytes without extracting anything
    pub fn extend(&mut self, bytes: &[u8]) {
        self.stats.bytes_in += bytes.len() as u64;
        self.buffer.extend_from_slice(bytes);
    }

    /// Append bytes and return every message that is now complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.extend(bytes);
        let mut messages = Vec::new();
        while let Some(message) = self.next_message() {
            messages.push(message);
        }
        messages
    }

    /// Extract the next complete message, or `None` when more bytes are needed.
    ///
    /// Malformed frames are logged and skipped without returning.
    pub fn next_message(&mut self) -> Option<Message> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }

            match find_magic(&self.buffer) {
                Some(0) => match try_decode(&self.buffer) {
                    DecodeOutcome::Incomplete => return None,
                    DecodeOutcome::Complete { frame, consumed } => {
                        self.buffer.drain(..consumed);
                        self.stats.frames += 1;
                        debug!(
                            "Frame {:?} for {:#06x}: {}",
                            frame.kind(),
                            frame.command_code(),
                            hex_dump(frame.raw_bytes())
                        );
                        return Some(Message::Binary(frame));
                    }
                    DecodeOutcome::Invalid { reason, consumed } => {
                        self.discard(reason, consumed);
                    }
                },
                Some(offset) => {
                    // Split at line ends first so the result does not depend on read boundaries
                    let end = self.buffer[..offset]
                        .iter()
                        .position(|&b| b == b'\n')
                        .map_or(offset, |newline| newline + 1);
                    let text = decode_text(&self.buffer[..end]);
                    self.buffer.drain(..end);
                    if let Some(message) = self.emit_text(text) {
                        return Some(message);
                    }
                }
                None => {
                    if let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
                        let text = decode_text(&self.buffer[..newline]);
                        self.buffer.drain(..=newline);
                        if let Some(message) = self.emit_text(text) {
                            return Some(message);
                        }
                        continue;
                    }

                    if self.buffer.len() <= self.max_line_len {
                        return None;
                    }

                    // Keep a possible partial anchor for the next read
                    let cut = self.buffer.len() - partial_magic_suffix(&self.buffer);
                    let text = decode_text(&self.buffer[..cut]);
                    self.buffer.drain(..cut);
                    if let Some(message) = self.emit_text(text) {
                        return Some(message);
                    }
                }
            }
        }
    }

    /// Drop everything buffered (used on reconnect)
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes waiting for more input
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Counts of what has been emitted and discarded so far
    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    fn emit_text(&mut self, text: String) -> Option<Message> {
        if text.is_empty() {
            return None;
        }
        self.stats.text_messages += 1;
        Some(Message::Text(text))
    }

    fn discard(&mut self, reason: FramingError, consumed: usize) {
        let consumed = consumed.clamp(1, self.buffer.len());
        warn!(
            "Discarding malformed frame ({}): {}",
            reason,
            hex_dump(&self.buffer[..consumed])
        );
        match reason {
            FramingError::CrcMismatch { .. } => self.stats.crc_errors += 1,
            FramingError::TooShort { .. } => self.stats.short_frames += 1,
            FramingError::Misaligned | FramingError::Oversized { .. } => {}
        }
        self.stats.bytes_discarded += consumed as u64;
        self.buffer.drain(..consumed);
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

fn find_magic(buffer: &[u8]) -> Option<usize> {
    buffer.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Length of the longest proper prefix of the magic that ends the buffer
fn partial_magic_suffix(buffer: &[u8]) -> usize {
    (1..MAGIC.len())
        .rev()
        .find(|&n| buffer.ends_with(&MAGIC[..n]))
        .unwrap_or(0)
}

fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{encode, encode_control, encode_data, FrameKind};
    use pretty_assertions::assert_eq;

    fn done(code: u16) -> Vec<u8> {
        encode_control(code, FrameKind::Done, 0x0000)
    }

    fn frame_of(bytes: &[u8]) -> Frame {
        match try_decode(bytes) {
            DecodeOutcome::Complete { frame, .. } => frame,
            other => panic!("Expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_text_and_frames_interleaved() {
        let frame = done(0x1000);
        let mut stream = b"hello\n".to_vec();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(b"world\n");

        let mut reassembler = StreamReassembler::new();
        let messages = reassembler.push(&stream);

        assert_eq!(
            messages,
            vec![
                Message::Text("hello".to_string()),
                Message::Binary(frame_of(&frame)),
                Message::Text("world".to_string()),
            ]
        );
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let frame = encode_data(0x1000, 0, &[0x01, 0x00, 0x00]).unwrap();
        let mut stream = b"INFO: boot\r\n".to_vec();
        stream.extend_from_slice(&frame);

        let mut reassembler = StreamReassembler::new();
        let mut messages = Vec::new();
        for byte in &stream {
            messages.extend(reassembler.push(std::slice::from_ref(byte)));
        }

        assert_eq!(
            messages,
            vec![
                Message::Text("INFO: boot".to_string()),
                Message::Binary(frame_of(&frame)),
            ]
        );
    }

    #[test]
    fn test_lines_before_anchor_split_at_newlines() {
        let frame = done(0x1002);
        let mut stream = b"line one\nline two".to_vec();
        stream.extend_from_slice(&frame);

        let messages = StreamReassembler::new().push(&stream);
        assert_eq!(
            messages,
            vec![
                Message::Text("line one".to_string()),
                Message::Text("line two".to_string()),
                Message::Binary(frame_of(&frame)),
            ]
        );
    }

    #[test]
    fn test_back_to_back_frames_in_one_read() {
        let mut stream = encode_control(0x1002, FrameKind::Ack, 0);
        stream.extend_from_slice(&done(0x1002));

        let messages = StreamReassembler::new().push(&stream);
        let kinds: Vec<FrameKind> = messages
            .iter()
            .filter_map(|m| m.frame().map(Frame::kind))
            .collect();
        assert_eq!(kinds, vec![FrameKind::Ack, FrameKind::Done]);
    }

    #[test]
    fn test_corrupt_frame_skipped_by_declared_length() {
        let mut corrupt = done(0x1002);
        corrupt[7] ^= 0x40;
        let good = done(0x1000);

        let mut stream = corrupt.clone();
        stream.extend_from_slice(&good);

        let mut reassembler = StreamReassembler::new();
        let messages = reassembler.push(&stream);

        assert_eq!(messages, vec![Message::Binary(frame_of(&good))]);
        let stats = reassembler.stats();
        assert_eq!(stats.crc_errors, 1);
        assert_eq!(stats.bytes_discarded, corrupt.len() as u64);
        assert_eq!(stats.frames, 1);
    }

    #[test]
    fn test_short_frame_is_discarded() {
        // Echo of a host request: payload shorter than any reply
        let mut stream = encode(0x1002, &[0x01]).unwrap();
        stream.extend_from_slice(b"after\n");

        let mut reassembler = StreamReassembler::new();
        let messages = reassembler.push(&stream);

        assert_eq!(messages, vec![Message::Text("after".to_string())]);
        assert_eq!(reassembler.stats().short_frames, 1);
    }

    #[test]
    fn test_unterminated_text_waits() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.push(b"partial line").is_empty());
        assert_eq!(reassembler.buffered(), 12);

        let messages = reassembler.push(b" done\n");
        assert_eq!(messages, vec![Message::Text("partial line done".to_string())]);
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = done(0x2000);
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.push(&frame[..7]).is_empty());
        assert_eq!(reassembler.push(&frame[7..]), vec![Message::Binary(frame_of(&frame))]);
    }

    #[test]
    fn test_blank_lines_are_dropped() {
        let messages = StreamReassembler::new().push(b"\r\n   \n\nok\n");
        assert_eq!(messages, vec![Message::Text("ok".to_string())]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let messages = StreamReassembler::new().push(b"temp \xff\xfe ok\n");
        match &messages[..] {
            [Message::Text(text)] => {
                assert!(text.starts_with("temp "));
                assert!(text.ends_with(" ok"));
            }
            other => panic!("Expected one text message, got {:?}", other),
        }
    }

    #[test]
    fn test_long_line_flushed_keeping_partial_anchor() {
        let mut reassembler = StreamReassembler::with_max_line_len(8);
        let messages = reassembler.push(b"0123456789CM");

        assert_eq!(messages, vec![Message::Text("0123456789".to_string())]);
        assert_eq!(reassembler.buffered(), 2);

        let frame = done(0x1002);
        let messages = reassembler.push(&frame[2..]);
        assert_eq!(messages, vec![Message::Binary(frame_of(&frame))]);
    }

    #[test]
    fn test_reset_drops_buffer() {
        let mut reassembler = StreamReassembler::new();
        reassembler.push(b"CM>\x00");
        assert_eq!(reassembler.buffered(), 4);
        reassembler.reset();
        assert_eq!(reassembler.buffered(), 0);
        assert!(reassembler.push(b"fresh\n").len() == 1);
    }

    #[test]
    fn test_partial_magic_suffix() {
        assert_eq!(partial_magic_suffix(b"abcC"), 1);
        assert_eq!(partial_magic_suffix(b"abcCM"), 2);
        assert_eq!(partial_magic_suffix(b"abc"), 0);
    }
}

//! Protocol errors
//!
//! One enum per layer: framing problems are recovered inside the reader,
//! correlator errors end a single exchange, and transport errors end the
//! session.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::DeviceStatus;

/// A frame that could not be decoded.
///
/// `DecodeOutcome::Incomplete` is the back-pressure signal and is not an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("payload too short: declared {payload_len} bytes, need at least 6")]
    TooShort { payload_len: usize },

    #[error("CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch { expected: u8, actual: u8 },

    #[error("buffer does not start with the CM> anchor")]
    Misaligned,

    #[error("params too large: {len} bytes (max {max})")]
    Oversized { len: usize, max: usize },
}

/// Errors raised by the byte transport. Fatal to the reader loop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Link closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::PortNotFound(e.description),
            _ => TransportError::Serial(e.to_string()),
        }
    }
}

/// Which part of a completion was still missing when the window closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPhase {
    /// DONE never arrived
    Done,
    /// DONE arrived but DATA did not
    Data,
    /// Neither arrived
    DataAndDone,
}

impl fmt::Display for CompletionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionPhase::Done => f.write_str("DONE"),
            CompletionPhase::Data => f.write_str("DATA"),
            CompletionPhase::DataAndDone => f.write_str("DATA and DONE"),
        }
    }
}

/// Failure of a single command exchange. The correlator is back to idle
/// whenever one of these is returned.
#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("timed out after {waited:?} waiting for ACK to command {command_code:#06x}")]
    AckTimeout { command_code: u16, waited: Duration },

    #[error("timed out after {waited:?} waiting for {phase} of command {command_code:#06x}")]
    DoneTimeout {
        command_code: u16,
        phase: CompletionPhase,
        waited: Duration,
    },

    #[error("command {command_code:#06x} finished with status {actual:#06x}, expected {expected:#06x}")]
    UnexpectedStatus {
        command_code: u16,
        expected: u16,
        actual: u16,
    },

    #[error("DATA for command {command_code:#06x} was {actual} bytes, expected {expected}")]
    DataLengthMismatch {
        command_code: u16,
        expected: usize,
        actual: usize,
    },

    /// NACK received for a request with `reject_on_nack` set
    #[error("command {command_code:#06x} rejected by device: {status}")]
    Rejected {
        command_code: u16,
        status: DeviceStatus,
    },

    #[error("command {command_code:#06x} cancelled by caller")]
    Cancelled { command_code: u16 },

    #[error("no command outstanding")]
    Idle,

    #[error("message stream closed")]
    LinkClosed,

    #[error("failed to encode command: {0}")]
    Framing(#[from] FramingError),

    #[error("transport write failed: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced by [`Session`](super::Session)
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected to controller")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("No serial port configured")]
    NoPortConfigured,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(CorrelatorError),

    #[error("Failed to start reader thread: {0}")]
    Spawn(std::io::Error),
}

impl From<CorrelatorError> for SessionError {
    fn from(e: CorrelatorError) -> Self {
        match e {
            CorrelatorError::Transport(t) => SessionError::Transport(t),
            other => SessionError::Protocol(other),
        }
    }
}

/// Errors from building requests out of the command catalogue
#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Duplicate command name: {0}")]
    Duplicate(String),

    #[error("{command} takes {expected} argument(s), got {actual}")]
    ArgumentCount {
        command: String,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidArgument {
        name: String,
        value: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalogue parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

//! CM> Serial Protocol
//!
//! Implements the host side of the `CM>` framed protocol spoken by the
//! dispatcher controller over its USB/serial console.
//!
//! The link carries two kinds of traffic on one byte stream: binary frames
//! anchored by the `CM>` magic, and free-form diagnostic text lines printed by
//! the firmware. [`StreamReassembler`] separates them, [`ResponseCorrelator`]
//! matches replies to the single outstanding command, and [`Session`] wires a
//! transport, reader thread and correlator together.

/// Parameter encoding for catalogue commands
pub mod command_builder;
/// Command catalogue and known controller commands
pub mod commands;
mod correlator;
mod error;
mod frame;
mod reader;
mod reassembler;
/// Serial port discovery and setup
pub mod serial;
mod session;
mod status;
/// Byte transports
pub mod stream;

pub use command_builder::{ParamKind, ParamSpec};
pub use commands::{
    CommandCatalogue, CommandSpec, ControllerState, SystemStatus, CMD_DISPENSER_WASH, CMD_GET_STATUS,
    CMD_INIT,
};
pub use correlator::{
    CancelToken, Completion, CorrelatorState, LogSink, OutOfBandSink, Request, Response,
    ResponseCorrelator,
};
pub use error::{
    CatalogueError, CompletionPhase, CorrelatorError, FramingError, SessionError,
    TransportError,
};
pub use frame::{
    encode, encode_control, encode_data, hex_dump, try_decode, xor_crc, DataLayout, DecodeOutcome,
    Frame, FrameKind, DATA_ENVELOPE_LEN, DATA_ENVELOPE_TYPE,
};
pub use reader::{spawn_reader, ReaderExit, ReaderHandle, RxCounters};
pub use reassembler::{Message, ReassemblerStats, StreamReassembler};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use session::{LinkCounters, Session, SessionState};
pub use status::DeviceStatus;
pub use stream::{ByteSink, ByteSource, SerialChannel, TcpChannel};

/// Frame anchor: ASCII `CM>`
pub const MAGIC: [u8; 3] = *b"CM>";

/// Bytes preceding the payload: magic + 2-byte length
pub const HEADER_LEN: usize = 5;

/// Payload length of a fixed-size ACK/DONE/NACK frame:
/// command code (2) + type (1) + status (2) + CRC (1)
pub const CONTROL_PAYLOAD_LEN: usize = 6;

/// Largest parameter block the 16-bit length field can describe
pub const MAX_PARAMS_LEN: usize = u16::MAX as usize - 3;

/// Default baud rate for the controller's virtual COM port
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time to wait for an ACK after sending a command
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 5000;

/// Default bounded wait per correlator poll cycle
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default sleep between empty transport reads in the reader thread
pub const DEFAULT_READ_BACKOFF_MS: u64 = 10;

/// Text without a line terminator is flushed once the buffer grows past this
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

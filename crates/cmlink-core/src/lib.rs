//! # CMLink Core Library
//!
//! Host-side link to the dispatcher controller over its `CM>` serial protocol.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Frame encoding and decoding (`CM>` magic, big-endian length, XOR CRC)
//! - Reassembly of a byte stream mixing binary frames and debug text lines
//! - Command/response correlation with ACK, DATA and DONE tracking
//! - Serial and TCP transports with a background reader thread
//! - A named command catalogue for the controller's commands
//!
//! ## Example
//!
//! ```rust,ignore
//! use cmlink_core::prelude::*;
//!
//! let config = SessionConfig::for_port("/dev/ttyACM0");
//! let mut session = Session::open(config)?;
//!
//! let catalogue = CommandCatalogue::builtin();
//! let response = session.execute(&catalogue.request("GET_STATUS", &[])?)?;
//! if let Some(status) = response.data.as_deref().and_then(SystemStatus::parse) {
//!     println!("Controller is {}", status.state);
//! }
//! ```

/// Session configuration files
pub mod config;
/// Wire protocol, transports and the command session
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, SessionConfig};
    pub use crate::protocol::{
        CommandCatalogue, CommandSpec, Completion, CorrelatorError, DeviceStatus, Frame,
        FrameKind, Message, Request, Response, Session, SessionError, SessionState,
        SystemStatus,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

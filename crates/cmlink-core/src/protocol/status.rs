//! Controller status codes
//!
//! Carried big-endian in the two status bytes of DONE and NACK frames.

use std::fmt;

/// Status reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// Command completed (0x0000)
    Ok,
    /// No handler registered for the command code (0x0001)
    UnknownCommand,
    /// Controller saw a CRC mismatch on our frame (0x0002)
    CrcError,
    /// Parameter block has the wrong length or contents (0x0003)
    InvalidParams,
    /// Job manager refused to start the job (0x0004)
    JobFailedToStart,
    /// Parameter block exceeds the controller's buffer (0x0005)
    ParamsTooLarge,
    /// Any code the host does not know about
    Other(u16),
}

impl DeviceStatus {
    /// Wire value of this status
    pub fn code(self) -> u16 {
        match self {
            DeviceStatus::Ok => 0x0000,
            DeviceStatus::UnknownCommand => 0x0001,
            DeviceStatus::CrcError => 0x0002,
            DeviceStatus::InvalidParams => 0x0003,
            DeviceStatus::JobFailedToStart => 0x0004,
            DeviceStatus::ParamsTooLarge => 0x0005,
            DeviceStatus::Other(code) => code,
        }
    }

    /// True for the success status
    pub fn is_ok(self) -> bool {
        self == DeviceStatus::Ok
    }
}

impl From<u16> for DeviceStatus {
    fn from(code: u16) -> Self {
        match code {
            0x0000 => DeviceStatus::Ok,
            0x0001 => DeviceStatus::UnknownCommand,
            0x0002 => DeviceStatus::CrcError,
            0x0003 => DeviceStatus::InvalidParams,
            0x0004 => DeviceStatus::JobFailedToStart,
            0x0005 => DeviceStatus::ParamsTooLarge,
            other => DeviceStatus::Other(other),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Ok => write!(f, "ok (0x0000)"),
            DeviceStatus::UnknownCommand => write!(f, "unknown command (0x0001)"),
            DeviceStatus::CrcError => write!(f, "CRC error (0x0002)"),
            DeviceStatus::InvalidParams => write!(f, "invalid parameters (0x0003)"),
            DeviceStatus::JobFailedToStart => write!(f, "job failed to start (0x0004)"),
            DeviceStatus::ParamsTooLarge => write!(f, "parameters too large (0x0005)"),
            DeviceStatus::Other(code) => write!(f, "status {:#06x}", code),
        }
    }
}

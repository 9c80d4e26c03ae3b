//! Session configuration
//!
//! Link settings stored as JSON. Every field has a default, so a config file
//! only needs the values it changes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{
    DataLayout, DEFAULT_ACK_TIMEOUT_MS, DEFAULT_BAUD_RATE, DEFAULT_MAX_LINE_LEN,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_READ_BACKOFF_MS,
};

/// Errors loading or validating a [`SessionConfig`]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Link and timing settings for a [`Session`](crate::protocol::Session)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial port name (e.g. "/dev/ttyACM0" or "COM3")
    pub port_name: Option<String>,

    /// Serial baud rate
    pub baud_rate: u32,

    /// Wait for ACK/NACK after sending a command
    pub ack_timeout_ms: u64,

    /// Wait for DONE/DATA after the ACK; twice the ACK timeout when unset
    pub completion_timeout_ms: Option<u64>,

    /// Longest single wait on the message channel
    pub poll_interval_ms: u64,

    /// Reader sleep after an empty read
    pub read_backoff_ms: u64,

    /// Pause after opening the port while the controller's USB stack settles
    pub settle_delay_ms: u64,

    /// Bound on waiting for the reader thread at close
    pub join_timeout_ms: u64,

    /// Unterminated text is flushed past this many bytes
    pub max_line_len: usize,

    /// How DATA bodies are laid out
    pub data_layout: DataLayout,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            baud_rate: DEFAULT_BAUD_RATE,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            completion_timeout_ms: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            read_backoff_ms: DEFAULT_READ_BACKOFF_MS,
            settle_delay_ms: 2000,
            join_timeout_ms: 2000,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            data_layout: DataLayout::default(),
        }
    }
}

impl SessionConfig {
    /// Config for `port_name` with every other value defaulted
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: Some(port_name.into()),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reject settings that would stall or spin the link
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("baud_rate", self.baud_rate as u64),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("completion_timeout_ms", self.completion_timeout_ms.unwrap_or(1)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("read_backoff_ms", self.read_backoff_ms),
            ("join_timeout_ms", self.join_timeout_ms),
            ("max_line_len", self.max_line_len as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// ACK timeout as a `Duration`
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// DONE/DATA timeout, defaulting to twice the ACK timeout
    pub fn completion_timeout(&self) -> Duration {
        self.completion_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.ack_timeout() * 2)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reader backoff as a `Duration`
    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }

    /// Settle delay as a `Duration`
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Reader join timeout as a `Duration`
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

//! Command line definition

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use cmlink_core::protocol::command_builder::{parse_hex, parse_number};
use cmlink_core::protocol::{Completion, FrameKind, Request};

#[derive(Parser, Debug)]
#[command(name = "cmlink")]
#[command(about = "Host console for CM> framed controllers", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Serial port, e.g. /dev/ttyACM0 or COM3
    #[arg(short, long, global = true)]
    pub port: Option<String>,

    #[arg(short, long, global = true)]
    pub baud: Option<u32>,

    /// Serial-to-TCP bridge address instead of a local port
    #[arg(long, global = true, value_name = "HOST:PORT", conflicts_with = "port")]
    pub tcp: Option<String>,

    /// Session config file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Extra command catalogue (JSON), merged over the built-in commands
    #[arg(long, global = true, value_name = "FILE")]
    pub catalogue: Option<PathBuf>,

    /// ACK timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// List serial ports
    Ports,

    /// List known commands
    Commands,

    /// Print everything the controller sends
    Listen {
        /// Stop after this many seconds (default: run until interrupted)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Send a raw command code
    Send {
        /// Command code, decimal or 0x hex
        #[arg(value_parser = parse_code)]
        code: u16,

        /// Parameter bytes as hex, e.g. "01 03e8 05"
        #[arg(long, value_parser = parse_hex_bytes, default_value = "")]
        params: HexBytes,

        /// Expected acknowledgement frame
        #[arg(long, value_enum, default_value_t = AckKind::Ack)]
        ack: AckKind,

        /// Expected DONE status
        #[arg(long, value_parser = parse_code)]
        done: Option<u16>,

        /// Expect a DATA frame with this many result bytes
        #[arg(long, value_name = "LEN")]
        data: Option<usize>,

        /// Stop after the acknowledgement
        #[arg(long, conflicts_with_all = ["done", "data"])]
        ack_only: bool,

        /// Fail as soon as the controller NACKs the command
        #[arg(long)]
        reject_on_nack: bool,
    },

    /// Run a catalogue command by name
    Run {
        #[arg(value_name = "NAME")]
        name: String,

        #[arg(value_name = "ARGS", allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    Nack,
}

impl From<AckKind> for FrameKind {
    fn from(kind: AckKind) -> Self {
        match kind {
            AckKind::Ack => FrameKind::Ack,
            AckKind::Nack => FrameKind::Nack,
        }
    }
}

/// Parsed `--params` value
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

fn parse_code(value: &str) -> Result<u16, String> {
    let number = parse_number(value)?;
    u16::try_from(number).map_err(|_| format!("{} does not fit in 16 bits", value))
}

fn parse_hex_bytes(value: &str) -> Result<HexBytes, String> {
    parse_hex(value).map(HexBytes)
}

impl Command {
    /// Build the request for a `send` invocation
    pub fn send_request(&self) -> Option<Request> {
        let Command::Send {
            code,
            params,
            ack,
            done,
            data,
            ack_only,
            reject_on_nack,
        } = self
        else {
            return None;
        };

        let status = done.unwrap_or(0);
        let completion = match (data, ack_only) {
            (_, true) => Completion::AckOnly,
            (Some(len), false) => Completion::DataAndDone { len: *len, status },
            (None, false) => Completion::Done { status },
        };
        Some(Request {
            command_code: *code,
            params: params.0.clone(),
            ack: (*ack).into(),
            completion,
            reject_on_nack: *reject_on_nack,
        })
    }
}

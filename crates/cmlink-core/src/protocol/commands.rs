//! Protocol commands
//!
//! Defines the commands supported by the dispatcher controller and the
//! catalogue that maps command names to codes, parameters and the replies
//! each one produces.

use std::fmt;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::command_builder::{build_params, ParamKind, ParamSpec};
use super::{CatalogueError, Completion, FrameKind, Request};

/// Code of the INIT recipe command
pub const CMD_INIT: u16 = 0x1002;
/// Code of the GET_STATUS direct command
pub const CMD_GET_STATUS: u16 = 0x1000;
/// Code of the DISPENSER_WASH recipe command
pub const CMD_DISPENSER_WASH: u16 = 0x2000;

/// One catalogue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Name used on the command line, matched case-insensitively
    pub name: String,
    /// Command code on the wire
    pub code: u16,
    /// Parameters in wire order
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Kind of the acknowledgement frame
    #[serde(default = "default_ack")]
    pub ack: FrameKind,
    /// What follows the acknowledgement
    #[serde(default = "default_completion")]
    pub completion: Completion,
    /// Fail at once when the controller NACKs this command
    #[serde(default)]
    pub reject_on_nack: bool,
    /// One-line help text
    #[serde(default)]
    pub description: String,
}

fn default_ack() -> FrameKind {
    FrameKind::Ack
}

fn default_completion() -> Completion {
    Completion::Done { status: 0 }
}

impl CommandSpec {
    /// Build a request from textual arguments, one per parameter
    pub fn request(&self, args: &[&str]) -> Result<Request, CatalogueError> {
        let params = build_params(&self.name, &self.params, args)?;
        Ok(Request {
            command_code: self.code,
            params,
            ack: self.ack,
            completion: self.completion,
            reject_on_nack: self.reject_on_nack,
        })
    }

    /// Usage line such as `DISPENSER_WASH <dispenser_id:u8> <volume:u16> <cycles:u8>`
    pub fn usage(&self) -> String {
        let mut usage = self.name.clone();
        for param in &self.params {
            let kind = match param.kind {
                ParamKind::U8 => "u8",
                ParamKind::U16 => "u16",
                ParamKind::U32 => "u32",
                ParamKind::Bytes => "hex",
            };
            usage.push_str(&format!(" <{}:{}>", param.name, kind));
        }
        usage
    }
}

#[derive(Deserialize)]
struct CatalogueFile {
    commands: Vec<CommandSpec>,
}

/// Named commands known to the host
#[derive(Debug, Clone, Default)]
pub struct CommandCatalogue {
    commands: Vec<CommandSpec>,
}

impl CommandCatalogue {
    /// Empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands implemented by the current controller firmware
    pub fn builtin() -> Self {
        let commands = vec![
            CommandSpec {
                name: "INIT".to_string(),
                code: CMD_INIT,
                params: vec![ParamSpec::new("mask", ParamKind::U8)],
                ack: FrameKind::Ack,
                completion: Completion::Done { status: 0 },
                reject_on_nack: false,
                description: "Home and initialise the subsystems selected by mask".to_string(),
            },
            CommandSpec {
                name: "GET_STATUS".to_string(),
                code: CMD_GET_STATUS,
                params: Vec::new(),
                ack: FrameKind::Ack,
                completion: Completion::DataAndDone { len: 3, status: 0 },
                reject_on_nack: false,
                description: "Read system state and last error code".to_string(),
            },
            CommandSpec {
                name: "DISPENSER_WASH".to_string(),
                code: CMD_DISPENSER_WASH,
                params: vec![
                    ParamSpec::new("dispenser_id", ParamKind::U8),
                    ParamSpec::new("volume", ParamKind::U16),
                    ParamSpec::new("cycles", ParamKind::U8),
                ],
                ack: FrameKind::Ack,
                completion: Completion::Done { status: 0 },
                reject_on_nack: false,
                description: "Run wash cycles on one dispenser".to_string(),
            },
        ];
        Self { commands }
    }

    /// Parse a catalogue from JSON: `{"commands": [...]}`
    pub fn from_json(json: &str) -> Result<Self, CatalogueError> {
        let file: CatalogueFile = serde_json::from_str(json)?;
        let mut catalogue = Self::new();
        for spec in file.commands {
            catalogue.insert(spec)?;
        }
        Ok(catalogue)
    }

    /// Load a JSON catalogue file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CatalogueError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Add a command. Names are unique, compared case-insensitively.
    pub fn insert(&mut self, spec: CommandSpec) -> Result<(), CatalogueError> {
        if self.get(&spec.name).is_some() {
            return Err(CatalogueError::Duplicate(spec.name));
        }
        self.commands.push(spec);
        Ok(())
    }

    /// Add every command of `other`, replacing entries with the same name
    pub fn merge(&mut self, other: CommandCatalogue) {
        for spec in other.commands {
            match self
                .commands
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(&spec.name))
            {
                Some(existing) => *existing = spec,
                None => self.commands.push(spec),
            }
        }
    }

    /// Look up a command by name, ignoring case
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Look up a command by wire code
    pub fn by_code(&self, code: u16) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.code == code)
    }

    /// Commands in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.iter()
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when the catalogue has no commands
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Look up `name` and build its request
    pub fn request(&self, name: &str, args: &[&str]) -> Result<Request, CatalogueError> {
        self.get(name)
            .ok_or_else(|| CatalogueError::UnknownCommand(name.to_string()))?
            .request(args)
    }
}

/// Controller state reported by GET_STATUS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    /// Booted, not yet initialised
    PowerOn,
    /// Homing after INIT
    Initializing,
    /// Idle and ready for jobs
    Ready,
    /// Running a job
    Busy,
    /// Stopped on an error; see `last_error`
    Error,
    /// State byte this host does not know
    Unknown(u8),
}

impl From<u8> for ControllerState {
    fn from(value: u8) -> Self {
        match value {
            0 => ControllerState::PowerOn,
            1 => ControllerState::Initializing,
            2 => ControllerState::Ready,
            3 => ControllerState::Busy,
            4 => ControllerState::Error,
            other => ControllerState::Unknown(other),
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::PowerOn => write!(f, "power-on"),
            ControllerState::Initializing => write!(f, "initializing"),
            ControllerState::Ready => write!(f, "ready"),
            ControllerState::Busy => write!(f, "busy"),
            ControllerState::Error => write!(f, "error"),
            ControllerState::Unknown(v) => write!(f, "unknown ({})", v),
        }
    }
}

/// Decoded GET_STATUS result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    /// Current controller state
    pub state: ControllerState,
    /// Code of the most recent error, 0 if none
    pub last_error: u16,
}

impl SystemStatus {
    /// Decode the 3 result bytes: state (u8), last error (u16 big-endian)
    pub fn parse(result: &[u8]) -> Option<Self> {
        if result.len() != 3 {
            return None;
        }
        Some(Self {
            state: ControllerState::from(result[0]),
            last_error: BigEndian::read_u16(&result[1..3]),
        })
    }
}

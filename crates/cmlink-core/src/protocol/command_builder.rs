//! Command Builder
//!
//! Builds command parameter blocks from typed parameter descriptions.
//!
//! Parameter kinds:
//! - u8    : single byte
//! - u16   : 16-bit value (big-endian)
//! - u32   : 32-bit value (big-endian)
//! - bytes : raw hex string, e.g. "0a0b0c" or "0a 0b 0c"
//!
//! Numeric arguments are accepted as decimal or `0x`-prefixed hex.

use super::CatalogueError;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Wire encoding of one command parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// One byte
    U8,
    /// Big-endian 16-bit integer
    U16,
    /// Big-endian 32-bit integer
    U32,
    /// Raw bytes given as hex
    Bytes,
}

/// A named parameter of a catalogue command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Name shown in usage and errors
    pub name: String,
    /// Wire encoding
    pub kind: ParamKind,
}

impl ParamSpec {
    /// Create a parameter description
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Parse `value` and append its big-endian encoding to `out`
    pub fn encode_into(&self, value: &str, out: &mut Vec<u8>) -> Result<(), CatalogueError> {
        match self.kind {
            ParamKind::U8 => {
                let v = self.parse_number(value, u8::MAX as u64)?;
                out.push(v as u8);
            }
            ParamKind::U16 => {
                let v = self.parse_number(value, u16::MAX as u64)?;
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, v as u16);
                out.extend_from_slice(&buf);
            }
            ParamKind::U32 => {
                let v = self.parse_number(value, u32::MAX as u64)?;
                let mut buf = [0u8; 4];
                BigEndian::write_u32(&mut buf, v as u32);
                out.extend_from_slice(&buf);
            }
            ParamKind::Bytes => {
                let bytes = parse_hex(value).map_err(|reason| self.invalid(value, reason))?;
                out.extend_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn parse_number(&self, value: &str, max: u64) -> Result<u64, CatalogueError> {
        let parsed = parse_number(value).map_err(|reason| self.invalid(value, reason))?;
        if parsed > max {
            return Err(self.invalid(value, format!("exceeds maximum {}", max)));
        }
        Ok(parsed)
    }

    fn invalid(&self, value: &str, reason: String) -> CatalogueError {
        CatalogueError::InvalidArgument {
            name: self.name.clone(),
            value: value.to_string(),
            reason,
        }
    }
}

/// Parse a decimal or `0x`-prefixed hex number
pub fn parse_number(value: &str) -> Result<u64, String> {
    let trimmed = value.trim();
    let result = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    result.map_err(|e| e.to_string())
}

/// Parse a hex string into bytes. Whitespace, `:` and `-` separators are ignored.
pub fn parse_hex(value: &str) -> Result<Vec<u8>, String> {
    let trimmed = value.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: Vec<char> = body
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();

    if digits.len() % 2 != 0 {
        return Err("odd number of hex digits".to_string());
    }

    digits
        .chunks(2)
        .map(|pair| {
            let text: String = pair.iter().collect();
            u8::from_str_radix(&text, 16).map_err(|_| format!("invalid hex byte '{}'", text))
        })
        .collect()
}

/// Encode `args` against `params`, one argument per parameter
pub fn build_params(
    command: &str,
    params: &[ParamSpec],
    args: &[&str],
) -> Result<Vec<u8>, CatalogueError> {
    if params.len() != args.len() {
        return Err(CatalogueError::ArgumentCount {
            command: command.to_string(),
            expected: params.len(),
            actual: args.len(),
        });
    }

    let mut out = Vec::new();
    for (spec, arg) in params.iter().zip(args) {
        spec.encode_into(arg, &mut out)?;
    }
    Ok(out)
}

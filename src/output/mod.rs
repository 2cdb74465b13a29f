//! Value formatters for characteristic payloads.
//!
//! This module provides a trait for turning the raw bytes of a characteristic
//! value into the text that follows the timestamp in each log line, plus the
//! implementations selectable with `--format`.

pub mod hex;
pub mod int32;

use std::fmt;
use thiserror::Error;

pub use hex::HexFormatter;
pub use int32::Int32Formatter;

/// Separator between the tokens of one log line.
pub const TOKEN_SEPARATOR: &str = ", ";

/// Errors returned when a payload cannot be rendered in the configured format.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The payload is shorter than the format requires
    #[error("payload too short: need {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
}

/// Trait for formatting a raw characteristic value.
///
/// Implementations return the decoded tokens joined with [`TOKEN_SEPARATOR`],
/// without the timestamp. An empty string means nothing follows the timestamp.
pub trait OutputFormatter: Send + Sync {
    fn format(&self, raw: &[u8]) -> Result<String, DecodeError>;
}

/// Value formats selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ValueFormat {
    /// One lowercase hex token per byte
    #[default]
    #[value(name = "x")]
    Hex,
    /// First four bytes as a little-endian signed 32-bit integer
    #[value(name = "i", alias = "d")]
    Int32,
}

impl ValueFormat {
    pub fn formatter(self) -> Box<dyn OutputFormatter> {
        match self {
            ValueFormat::Hex => Box::new(HexFormatter),
            ValueFormat::Int32 => Box::new(Int32Formatter),
        }
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFormat::Hex => write!(f, "x"),
            ValueFormat::Int32 => write!(f, "i"),
        }
    }
}

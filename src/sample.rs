//! One recorded characteristic value.

use crate::output::TOKEN_SEPARATOR;
use chrono::{DateTime, Local};

/// Timestamp layout of a log line: `MM/dd/yyyy hh:mm:ss.fff` on a 12-hour clock.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S%.3f";

/// A characteristic value as it is written to the log.
///
/// Built once per notification or poll read and dropped after it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedSample {
    /// Local time the value was received
    pub timestamp: DateTime<Local>,
    /// Value bytes as delivered by the peripheral
    pub raw: Vec<u8>,
    /// Formatted value tokens, without the timestamp
    pub decoded: String,
}

impl LoggedSample {
    /// Render the log line, `<timestamp>, <decoded>` (no trailing newline).
    pub fn line(&self) -> String {
        let timestamp = self.timestamp.format(TIMESTAMP_FORMAT);
        if self.decoded.is_empty() {
            timestamp.to_string()
        } else {
            format!("{timestamp}{TOKEN_SEPARATOR}{}", self.decoded)
        }
    }
}

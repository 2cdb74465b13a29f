//! Per-byte hexadecimal formatter.

use crate::output::{DecodeError, OutputFormatter, TOKEN_SEPARATOR};
use std::fmt::Write;

/// Renders every byte as lowercase hex without zero padding (`0x05` → `5`).
#[derive(Debug, Default, Clone, Copy)]
pub struct HexFormatter;

impl OutputFormatter for HexFormatter {
    fn format(&self, raw: &[u8]) -> Result<String, DecodeError> {
        let mut out = String::with_capacity(raw.len() * 4);
        for (i, byte) in raw.iter().enumerate() {
            if i > 0 {
                out.push_str(TOKEN_SEPARATOR);
            }
            // Writing to a String cannot fail
            let _ = write!(out, "{byte:x}");
        }
        Ok(out)
    }
}

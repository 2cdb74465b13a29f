//! Little-endian signed 32-bit integer formatter.

use crate::output::{DecodeError, OutputFormatter};

const INT32_LEN: usize = 4;

/// Interprets the first four bytes as an `i32` (little-endian); trailing bytes are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct Int32Formatter;

impl OutputFormatter for Int32Formatter {
    fn format(&self, raw: &[u8]) -> Result<String, DecodeError> {
        let bytes: [u8; INT32_LEN] = raw
            .get(..INT32_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(DecodeError::TooShort {
                needed: INT32_LEN,
                got: raw.len(),
            })?;
        Ok(i32::from_le_bytes(bytes).to_string())
    }
}

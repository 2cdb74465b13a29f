//! Value recorder: formats each received value and persists it.
//!
//! The recorder keeps no state between samples. Console output and the file
//! append of one sample happen under a single lock, so samples delivered
//! back-to-back from different tasks never interleave.

use crate::logfile::LogFile;
use crate::output::{DecodeError, OutputFormatter, ValueFormat};
use crate::sample::LoggedSample;
use chrono::{DateTime, Local};
use log::warn;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Errors for a single recorder invocation.
///
/// These never outlive the sample: the session logs them and keeps going.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("cannot format value: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to write `{line}` to console: {source}")]
    Console {
        line: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to append `{line}` to {}: {source}", path.display())]
    Append {
        line: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct Recorder {
    formatter: Box<dyn OutputFormatter>,
    log: LogFile,
    console: Mutex<Box<dyn Write + Send>>,
}

impl Recorder {
    /// Create a recorder that echoes to stdout.
    pub fn new(log: LogFile, format: ValueFormat) -> Self {
        Self::with_console(log, format, Box::new(io::stdout()))
    }

    pub fn with_console(log: LogFile, format: ValueFormat, console: Box<dyn Write + Send>) -> Self {
        Self {
            formatter: format.formatter(),
            log,
            console: Mutex::new(console),
        }
    }

    /// Record `raw` stamped with the current local time.
    pub fn record(&self, raw: &[u8]) -> Result<LoggedSample, RecordError> {
        self.record_at(Local::now(), raw)
    }

    pub fn record_at(
        &self,
        timestamp: DateTime<Local>,
        raw: &[u8],
    ) -> Result<LoggedSample, RecordError> {
        let decoded = self.formatter.format(raw)?;
        let sample = LoggedSample {
            timestamp,
            raw: raw.to_vec(),
            decoded,
        };
        let line = sample.line();

        let mut console = self.console.lock().unwrap_or_else(PoisonError::into_inner);
        let echoed = writeln!(console, "{line}").and_then(|_| console.flush());
        // Append even if the console write failed
        let appended = self.log.append(&line);
        drop(console);

        if let Err(source) = appended {
            if let Err(e) = echoed {
                warn!("console write failed too: {e}");
            }
            return Err(RecordError::Append {
                line,
                path: self.log.path().to_path_buf(),
                source,
            });
        }
        if let Err(source) = echoed {
            return Err(RecordError::Console { line, source });
        }

        Ok(sample)
    }
}

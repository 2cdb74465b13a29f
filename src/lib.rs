//! `ble-logger` library.
//!
//! The binary (`src/main.rs`) is responsible for logging setup and process exit codes.
//! The core pipeline lives in [`crate::app`] where it can be tested
//! deterministically with an injected central and injected output streams.

pub mod app;
pub mod config;
pub mod discoverer;
pub mod listener;
pub mod logfile;
pub mod mac_address;
pub mod output;
pub mod recorder;
pub mod sample;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{Options, RunError};
pub use config::{Config, ConfigError, Mode, parse_interval};
pub use mac_address::MacAddress;
pub use output::{DecodeError, OutputFormatter, ValueFormat};
pub use recorder::{RecordError, Recorder};
pub use sample::LoggedSample;
pub use transport::{AdvertisementSource, Backend, BleError, Central};

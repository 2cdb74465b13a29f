//! Validated run configuration.
//!
//! Built once from the command line options and never mutated afterwards.

use crate::app::Options;
use crate::output::ValueFormat;
use crate::transport::Backend;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// How long listen mode reports advertisements before returning.
pub const LISTEN_WINDOW: Duration = Duration::from_secs(10);

/// How values reach the recorder once the session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Subscribe to change notifications
    Notify,
    /// Read the characteristic on a fixed period
    Poll(Duration),
}

impl Mode {
    /// Zero interval means notifications.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            Mode::Notify
        } else {
            Mode::Poll(interval)
        }
    }
}

/// Errors detected before any Bluetooth activity starts.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("a service UUID (-s/--service) is required unless --listen is given")]
    MissingService,
    #[error("backend '{0}' can only be used with --listen")]
    ListenOnlyBackend(Backend),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Exact advertised name to accept; `None` accepts any device
    pub name_filter: Option<String>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub mode: Mode,
    pub output: PathBuf,
    pub format: ValueFormat,
    pub listen_only: bool,
    pub backend: Backend,
}

impl TryFrom<Options> for Config {
    type Error = ConfigError;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        if !options.listen {
            if options.service.is_nil() {
                return Err(ConfigError::MissingService);
            }
            if !options.backend.supports_central() {
                return Err(ConfigError::ListenOnlyBackend(options.backend));
            }
        }

        Ok(Config {
            name_filter: options.name.filter(|name| !name.is_empty()),
            service: options.service,
            characteristic: options.characteristic,
            mode: Mode::from_interval(options.interval),
            output: options.output,
            format: options.format,
            listen_only: options.listen,
            backend: options.backend,
        })
    }
}

/// Parse a poll interval from a human-readable string.
///
/// Supports the following suffixes:
/// - `ms` or no suffix: milliseconds
/// - `s`: seconds
/// - `m`: minutes
/// - `h`: hours
///
/// # Examples
/// ```
/// use ble_logger::config::parse_interval;
/// use std::time::Duration;
///
/// assert_eq!(parse_interval("500").unwrap(), Duration::from_millis(500));
/// assert_eq!(parse_interval("2s").unwrap(), Duration::from_secs(2));
/// assert_eq!(parse_interval("0").unwrap(), Duration::ZERO);
/// ```
pub fn parse_interval(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty interval string".to_string());
    }

    if let Some(num) = src.strip_suffix("ms") {
        let millis: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid milliseconds: {}", num))?;
        return Ok(Duration::from_millis(millis));
    }

    if let Some(num) = src.strip_suffix('h') {
        let hours: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid hours: {}", num))?;
        return hours
            .checked_mul(3600)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("interval too large: {}", src));
    }

    if let Some(num) = src.strip_suffix('m') {
        let minutes: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid minutes: {}", num))?;
        return minutes
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("interval too large: {}", src));
    }

    if let Some(num) = src.strip_suffix('s') {
        let secs: u64 = num
            .trim()
            .parse()
            .map_err(|_| format!("invalid seconds: {}", num))?;
        return Ok(Duration::from_secs(secs));
    }

    let millis: u64 = src
        .parse()
        .map_err(|_| format!("invalid interval: {}", src))?;
    Ok(Duration::from_millis(millis))
}

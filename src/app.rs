//! Core application runner for `ble-logger`.
//!
//! This module is decoupled from process exit handling so the pipeline can be
//! tested deterministically against fake transports.

use crate::config::{Config, ConfigError, LISTEN_WINDOW};
use crate::discoverer::{DiscoveryError, discover};
use crate::listener::{ListenError, listen};
use crate::logfile::LogFile;
use crate::output::ValueFormat;
use crate::recorder::Recorder;
use crate::session::{SessionError, establish};
use crate::transport::{AdvertisementSource, Backend, BleError, Central};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Exit code for service or characteristic resolution failures.
pub const EXIT_RESOLUTION_FAILURE: i32 = -1;
/// Exit code for every other fatal error.
pub const EXIT_ERROR: i32 = 1;

/// Command line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Only connect to a device advertising exactly this name
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// Service UUID the device must advertise (required unless --listen)
    #[arg(short = 's', long = "service", default_value_t = Uuid::nil())]
    pub service: Uuid,

    /// Characteristic UUID to log
    #[arg(short = 'c', long = "characteristic", default_value_t = Uuid::nil())]
    pub characteristic: Uuid,

    /// Read interval; 0 subscribes to notifications instead.
    /// Plain numbers are milliseconds; 500ms, 2s, 1m, 1h are accepted.
    #[arg(short = 'i', long = "interval", default_value = "0", value_parser = crate::config::parse_interval)]
    pub interval: Duration,

    /// Print every advertisement received for 10 seconds, then exit
    #[arg(short = 'l', long = "listen")]
    pub listen: bool,

    /// Log file, appended to
    #[arg(short = 'o', long = "output", default_value = "log.txt")]
    pub output: PathBuf,

    /// Value format: x (hex per byte) or i (little-endian int32)
    #[arg(short = 'f', long = "format", default_value_t, value_enum)]
    pub format: ValueFormat,

    /// Verbose output, log scan traffic and per-step details
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Bluetooth backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,
}

/// Errors that end the run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ble(#[from] BleError),
    #[error(transparent)]
    Listen(#[from] ListenError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl RunError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Session(e) if e.is_resolution_failure() => EXIT_RESOLUTION_FAILURE,
            _ => EXIT_ERROR,
        }
    }
}

/// Discover, connect and log until the link is lost.
pub async fn run_session<C: Central>(
    config: &Config,
    central: &C,
    recorder: &Recorder,
) -> Result<(), RunError> {
    let device = discover(central, config.service, config.name_filter.clone()).await?;
    let session = establish(
        central,
        device,
        config.service,
        config.characteristic,
        config.mode,
    )
    .await?;
    info!("logging to {}", config.output.display());
    session.run(central, recorder).await?;
    Ok(())
}

/// Run listen mode against `source`, writing advertisement blocks to `out`.
pub async fn run_listen(
    source: &dyn AdvertisementSource,
    out: &mut dyn Write,
) -> Result<(), RunError> {
    listen(source, LISTEN_WINDOW, out).await?;
    Ok(())
}

/// Open the configured backend and run the selected mode.
pub async fn run(config: Config, out: &mut dyn Write) -> Result<(), RunError> {
    if config.listen_only {
        let source = crate::transport::open_advertisement_source(config.backend).await?;
        return run_listen(source.as_ref(), out).await;
    }

    match config.backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => {
            let central = crate::transport::bluer::BluerCentral::new().await?;
            let recorder = Recorder::new(LogFile::new(&config.output), config.format);
            run_session(&config, &central, &recorder).await
        }
        #[allow(unreachable_patterns)]
        backend => Err(BleError::BackendNotAvailable(backend.to_string()).into()),
    }
}

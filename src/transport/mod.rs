//! BLE transport abstraction.
//!
//! The session pipeline only talks to the traits in this module, so it can be
//! driven deterministically in tests. Backends are compiled in through cargo
//! features and selected at runtime with `--backend`.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel buffer size for advertisements, discovered devices and notifications.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`.
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Error type for transport operations.
#[derive(Error, Debug)]
pub enum BleError {
    /// No usable adapter (stack missing, daemon down, adapter absent or powered off)
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    /// Any other error reported by the Bluetooth stack
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in, or lacks the requested capability)
    #[error("Backend '{0}' not available")]
    BackendNotAvailable(String),
}

/// Boxed future returned by transport operations.
pub type BleFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BleError>> + Send + 'a>>;

/// A device that advertised the requested service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: MacAddress,
    /// Advertised name, empty when the device does not advertise one
    pub name: String,
}

/// One received advertising packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdvertisementRecord {
    pub address: MacAddress,
    pub local_name: String,
    pub service_uuids: BTreeSet<Uuid>,
}

/// Passive source of advertisements. Dropping the receiver stops the scan.
pub trait AdvertisementSource: Send + Sync {
    fn advertisements(&self) -> BleFuture<'_, mpsc::Receiver<AdvertisementRecord>>;
}

/// GATT central role: discovery, connection and characteristic access.
///
/// Collections are returned in the order the stack reports them; callers that
/// only need one instance take the first.
pub trait Central: Send + Sync {
    /// Live link to a peripheral. Dropping it may disconnect.
    type Connection: Send + Sync;
    type Service: Send + Sync;
    type Characteristic: Send + Sync;

    /// Start a scan reporting only devices that advertise `service`.
    ///
    /// The scan runs until the returned receiver is dropped.
    fn scan_for_service(&self, service: Uuid) -> BleFuture<'_, mpsc::Receiver<DiscoveredDevice>>;

    fn connect<'a>(&'a self, device: &'a DiscoveredDevice) -> BleFuture<'a, Self::Connection>;

    fn resolve_services<'a>(
        &'a self,
        connection: &'a Self::Connection,
        service: Uuid,
    ) -> BleFuture<'a, Vec<Self::Service>>;

    fn resolve_characteristics<'a>(
        &'a self,
        service: &'a Self::Service,
        characteristic: Uuid,
    ) -> BleFuture<'a, Vec<Self::Characteristic>>;

    /// Enable notifications and deliver every value change through the receiver.
    fn subscribe_notify<'a>(
        &'a self,
        characteristic: &'a Self::Characteristic,
    ) -> BleFuture<'a, mpsc::Receiver<Vec<u8>>>;

    fn read_once<'a>(&'a self, characteristic: &'a Self::Characteristic) -> BleFuture<'a, Vec<u8>>;
}

/// Available transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (passive advertisement listening only)
    #[cfg(feature = "hci")]
    Hci,
}

impl Backend {
    /// Whether this backend can run a GATT session, not just listen.
    pub fn supports_central(self) -> bool {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => true,
            #[cfg(feature = "hci")]
            Backend::Hci => false,
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
            #[cfg(not(any(feature = "bluer", feature = "hci")))]
            _ => unreachable!("Backend enum has no variants when no backend features are enabled"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}

/// Open the advertisement source for `backend`.
pub async fn open_advertisement_source(
    backend: Backend,
) -> Result<Box<dyn AdvertisementSource>, BleError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Ok(Box::new(bluer::BluerCentral::new().await?)),
        #[cfg(feature = "hci")]
        Backend::Hci => Ok(Box::new(hci::HciListener::new(hci::DEFAULT_HCI_DEVICE))),
    }
}

/// Expand a 16- or 32-bit assigned number against the Bluetooth base UUID.
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | (u128::from(short) << 96))
}

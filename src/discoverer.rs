//! Device discovery filtered by service UUID and, optionally, exact name.

use crate::transport::{BleError, Central, DiscoveredDevice};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no service UUID given, discovery not started")]
    MissingService,
    #[error("scan ended before a matching device was found")]
    ScanEnded,
    #[error(transparent)]
    Ble(#[from] BleError),
}

/// Accepts the first device that passes the name filter, and nothing after it.
///
/// Acceptance is a single atomic transition, so two scan events for the same
/// device arriving together still produce exactly one accepted device.
#[derive(Debug)]
pub struct DeviceMatcher {
    name_filter: Option<String>,
    accepted: AtomicBool,
}

impl DeviceMatcher {
    pub fn new(name_filter: Option<String>) -> Self {
        Self {
            name_filter,
            accepted: AtomicBool::new(false),
        }
    }

    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        self.name_filter
            .as_deref()
            .is_none_or(|name| name == device.name)
    }

    /// Offer a scan result; returns it only if it is the first match.
    pub fn offer(&self, device: DiscoveredDevice) -> Option<DiscoveredDevice> {
        if !self.matches(&device) {
            return None;
        }
        self.accepted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| device)
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }
}

/// Scan for a device advertising `service` and return the first match.
///
/// The scan is released as soon as a device is accepted. There is no timeout:
/// without a matching advertiser this waits until the backend ends the scan.
pub async fn discover<C: Central>(
    central: &C,
    service: Uuid,
    name_filter: Option<String>,
) -> Result<DiscoveredDevice, DiscoveryError> {
    if service.is_nil() {
        return Err(DiscoveryError::MissingService);
    }

    let matcher = DeviceMatcher::new(name_filter);
    let mut scan = central.scan_for_service(service).await?;
    info!("scanning for devices advertising {service}");

    while let Some(device) = scan.recv().await {
        let (address, name) = (device.address, device.name.clone());
        match matcher.offer(device) {
            Some(device) => {
                drop(scan);
                info!("found {} ({})", device.address, device.name);
                return Ok(device);
            }
            None => debug!("ignoring {address} ({name})"),
        }
    }

    Err(DiscoveryError::ScanEnded)
}

//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    AdvertisementRecord, AdvertisementSource, BleError, BleFuture, Central, DiscoveredDevice,
    EVENT_CHANNEL_BUFFER_SIZE,
};
use crate::mac_address::MacAddress;
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{
    Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::{StreamExt, pin_mut};
use log::{debug, info};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// How often to check whether BlueZ has finished resolving services after connecting.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for BleError {
    fn from(err: bluer::Error) -> Self {
        BleError::Bluetooth(err.to_string())
    }
}

/// GATT central on the default BlueZ adapter.
pub struct BluerCentral {
    // Keeps the D-Bus connection alive for the adapter handle
    _session: Session,
    adapter: Adapter,
}

impl BluerCentral {
    /// Connect to bluetoothd and power on the default adapter.
    pub async fn new() -> Result<Self, BleError> {
        let session = Session::new()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        info!("using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

/// Read the name and advertised service UUIDs BlueZ has cached for `address`.
async fn device_properties(
    adapter: &Adapter,
    address: Address,
) -> Result<(String, BTreeSet<Uuid>), BleError> {
    let device = adapter.device(address)?;
    let name = device.name().await?.unwrap_or_default();
    let uuids = device.uuids().await?.unwrap_or_default();
    Ok((name, uuids.into_iter().collect()))
}

/// Run an LE discovery with `filter`, forwarding device events through a channel.
///
/// Property updates of already known devices are reported too, which is how
/// BlueZ surfaces repeated advertisements. The discovery session ends when the
/// receiver is dropped.
async fn discover<T, F>(
    adapter: &Adapter,
    filter: DiscoveryFilter,
    describe: F,
) -> Result<mpsc::Receiver<T>, BleError>
where
    T: Send + 'static,
    F: Fn(Address, String, BTreeSet<Uuid>) -> Option<T> + Send + 'static,
{
    adapter.set_discovery_filter(filter).await?;

    let adapter = adapter.clone();
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
    let (status_tx, status_rx) = oneshot::channel();

    tokio::spawn(async move {
        let events = match adapter.discover_devices_with_changes().await {
            Ok(events) => {
                let _ = status_tx.send(Ok(()));
                events
            }
            Err(e) => {
                let _ = status_tx.send(Err(e));
                return;
            }
        };
        pin_mut!(events);

        loop {
            let event = tokio::select! {
                _ = tx.closed() => break,
                event = events.next() => event,
            };
            let Some(event) = event else { break };
            let AdapterEvent::DeviceAdded(address) = event else {
                continue;
            };
            match device_properties(&adapter, address).await {
                Ok((name, uuids)) => {
                    if let Some(item) = describe(address, name, uuids)
                        && tx.send(item).await.is_err()
                    {
                        break;
                    }
                }
                Err(e) => debug!("{address}: cannot read device properties: {e}"),
            }
        }
        debug!("discovery stopped");
    });

    status_rx
        .await
        .map_err(|_| BleError::Bluetooth("discovery task ended unexpectedly".into()))??;
    Ok(rx)
}

impl AdvertisementSource for BluerCentral {
    fn advertisements(&self) -> BleFuture<'_, mpsc::Receiver<AdvertisementRecord>> {
        Box::pin(async move {
            let filter = DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                duplicate_data: true,
                ..Default::default()
            };
            discover(&self.adapter, filter, |address, name, uuids| {
                Some(AdvertisementRecord {
                    address: address.into(),
                    local_name: name,
                    service_uuids: uuids,
                })
            })
            .await
        })
    }
}

impl Central for BluerCentral {
    type Connection = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    fn scan_for_service(&self, service: Uuid) -> BleFuture<'_, mpsc::Receiver<DiscoveredDevice>> {
        Box::pin(async move {
            let filter = DiscoveryFilter {
                uuids: HashSet::from([service]),
                transport: DiscoveryTransport::Le,
                ..Default::default()
            };
            // BlueZ also replays cached devices, so check the UUID list again
            discover(&self.adapter, filter, move |address, name, uuids| {
                uuids.contains(&service).then(|| DiscoveredDevice {
                    address: MacAddress::from(address),
                    name,
                })
            })
            .await
        })
    }

    fn connect<'a>(&'a self, device: &'a DiscoveredDevice) -> BleFuture<'a, Device> {
        Box::pin(async move {
            let device = self.adapter.device(device.address.into())?;
            if !device.is_connected().await? {
                device.connect().await?;
            }
            while !device.is_services_resolved().await? {
                tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
            }
            Ok(device)
        })
    }

    fn resolve_services<'a>(
        &'a self,
        connection: &'a Device,
        service: Uuid,
    ) -> BleFuture<'a, Vec<Service>> {
        Box::pin(async move {
            let mut matches = Vec::new();
            for candidate in connection.services().await? {
                if candidate.uuid().await? == service {
                    matches.push(candidate);
                }
            }
            Ok(matches)
        })
    }

    fn resolve_characteristics<'a>(
        &'a self,
        service: &'a Service,
        characteristic: Uuid,
    ) -> BleFuture<'a, Vec<Characteristic>> {
        Box::pin(async move {
            let mut matches = Vec::new();
            for candidate in service.characteristics().await? {
                if candidate.uuid().await? == characteristic {
                    matches.push(candidate);
                }
            }
            Ok(matches)
        })
    }

    fn subscribe_notify<'a>(
        &'a self,
        characteristic: &'a Characteristic,
    ) -> BleFuture<'a, mpsc::Receiver<Vec<u8>>> {
        Box::pin(async move {
            let characteristic = characteristic.clone();
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            let (status_tx, status_rx) = oneshot::channel();

            tokio::spawn(async move {
                // Writes the client characteristic configuration descriptor
                let values = match characteristic.notify().await {
                    Ok(values) => {
                        let _ = status_tx.send(Ok(()));
                        values
                    }
                    Err(e) => {
                        let _ = status_tx.send(Err(e));
                        return;
                    }
                };
                pin_mut!(values);

                loop {
                    let value = tokio::select! {
                        _ = tx.closed() => break,
                        value = values.next() => value,
                    };
                    match value {
                        Some(value) => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                debug!("notification stream ended");
            });

            status_rx
                .await
                .map_err(|_| BleError::Bluetooth("notification task ended unexpectedly".into()))??;
            Ok(rx)
        })
    }

    fn read_once<'a>(&'a self, characteristic: &'a Characteristic) -> BleFuture<'a, Vec<u8>> {
        Box::pin(async move { Ok(characteristic.read().await?) })
    }
}

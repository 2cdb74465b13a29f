use crate::mac_address::MacAddress;
use crate::transport::{
    AdvertisementRecord, AdvertisementSource, BleError, BleFuture, Central, DiscoveredDevice,
};
use chrono::{DateTime, Local, NaiveDate};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How long a fake scan stays open after its last advertisement.
const SCAN_LINGER: Duration = Duration::from_millis(100);

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A local timestamp with millisecond precision.
pub fn local_time(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    milli: u32,
) -> DateTime<Local> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_milli_opt(hour, minute, second, milli))
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .expect("valid local time")
}

/// A unique path in the temp directory; the file itself is not created.
pub fn temp_log_path(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("ble-logger-{}-{name}-{n}.txt", std::process::id()))
}

pub fn device(mac: MacAddress, name: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        address: mac,
        name: name.to_string(),
    }
}

/// Console stand-in whose contents stay readable after it is boxed away.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Advertisement source replaying records at fixed offsets from scan start.
pub struct FakeAdvertisementSource {
    records: Vec<(Duration, AdvertisementRecord)>,
    available: bool,
    stopped: Arc<AtomicBool>,
}

impl FakeAdvertisementSource {
    pub fn new(records: Vec<(Duration, AdvertisementRecord)>) -> Self {
        Self {
            records,
            available: true,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn scan_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl AdvertisementSource for FakeAdvertisementSource {
    fn advertisements(&self) -> BleFuture<'_, mpsc::Receiver<AdvertisementRecord>> {
        let records = self.records.clone();
        let available = self.available;
        let stopped = Arc::clone(&self.stopped);
        Box::pin(async move {
            if !available {
                return Err(BleError::AdapterUnavailable("no adapter".into()));
            }
            let (tx, rx) = mpsc::channel(records.len().max(1));
            let start = tokio::time::Instant::now();
            tokio::spawn(async move {
                for (offset, record) in records {
                    tokio::select! {
                        _ = tx.closed() => break,
                        _ = tokio::time::sleep_until(start + offset) => {
                            if tx.send(record).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                tx.closed().await;
                stopped.store(true, Ordering::SeqCst);
            });
            Ok(rx)
        })
    }
}

#[derive(Debug)]
pub struct FakeCharacteristic {
    pub uuid: Uuid,
    /// Values pushed once notifications are enabled
    pub notifications: Vec<Vec<u8>>,
    /// Values returned by successive reads; reads fail once exhausted
    pub reads: Mutex<VecDeque<Vec<u8>>>,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            notifications: Vec::new(),
            reads: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_notifications(mut self, values: Vec<Vec<u8>>) -> Self {
        self.notifications = values;
        self
    }

    pub fn with_reads(self, values: Vec<Vec<u8>>) -> Self {
        *self.reads.lock().unwrap() = values.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct FakeService {
    pub uuid: Uuid,
    pub characteristics: Vec<Arc<FakeCharacteristic>>,
}

/// Scripted GATT central that counts how often each step was attempted.
#[derive(Debug, Default)]
pub struct FakeCentral {
    pub advertising: Vec<(DiscoveredDevice, Vec<Uuid>)>,
    pub services: Vec<FakeService>,
    pub connect_fails: bool,
    pub service_resolution_fails: bool,
    pub characteristic_resolution_fails: bool,
    pub subscribe_fails: bool,
    pub connects: AtomicUsize,
    pub service_resolutions: AtomicUsize,
    pub characteristic_resolutions: AtomicUsize,
    pub subscriptions: AtomicUsize,
    pub scan_released: Arc<AtomicBool>,
}

impl FakeCentral {
    pub fn new(services: Vec<FakeService>) -> Self {
        Self {
            services,
            ..Default::default()
        }
    }

    pub fn advertise(mut self, device: DiscoveredDevice, services: Vec<Uuid>) -> Self {
        self.advertising.push((device, services));
        self
    }
}

impl Central for FakeCentral {
    type Connection = MacAddress;
    type Service = FakeService;
    type Characteristic = Arc<FakeCharacteristic>;

    fn scan_for_service(&self, service: Uuid) -> BleFuture<'_, mpsc::Receiver<DiscoveredDevice>> {
        let matching: Vec<DiscoveredDevice> = self
            .advertising
            .iter()
            .filter(|(_, uuids)| uuids.contains(&service))
            .map(|(device, _)| device.clone())
            .collect();
        let released = Arc::clone(&self.scan_released);
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(async move {
                for device in matching {
                    if tx.send(device).await.is_err() {
                        break;
                    }
                }
                // Give the consumer a moment to release the scan, then end it
                tokio::select! {
                    _ = tx.closed() => released.store(true, Ordering::SeqCst),
                    _ = tokio::time::sleep(SCAN_LINGER) => {}
                }
            });
            Ok(rx)
        })
    }

    fn connect<'a>(&'a self, device: &'a DiscoveredDevice) -> BleFuture<'a, MacAddress> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.connect_fails {
                return Err(BleError::Bluetooth("device unreachable".into()));
            }
            Ok(device.address)
        })
    }

    fn resolve_services<'a>(
        &'a self,
        _connection: &'a MacAddress,
        service: Uuid,
    ) -> BleFuture<'a, Vec<FakeService>> {
        Box::pin(async move {
            self.service_resolutions.fetch_add(1, Ordering::SeqCst);
            if self.service_resolution_fails {
                return Err(BleError::Bluetooth("unreachable".into()));
            }
            Ok(self
                .services
                .iter()
                .filter(|s| s.uuid == service)
                .cloned()
                .collect())
        })
    }

    fn resolve_characteristics<'a>(
        &'a self,
        service: &'a FakeService,
        characteristic: Uuid,
    ) -> BleFuture<'a, Vec<Arc<FakeCharacteristic>>> {
        Box::pin(async move {
            self.characteristic_resolutions
                .fetch_add(1, Ordering::SeqCst);
            if self.characteristic_resolution_fails {
                return Err(BleError::Bluetooth("access denied".into()));
            }
            Ok(service
                .characteristics
                .iter()
                .filter(|c| c.uuid == characteristic)
                .cloned()
                .collect())
        })
    }

    fn subscribe_notify<'a>(
        &'a self,
        characteristic: &'a Arc<FakeCharacteristic>,
    ) -> BleFuture<'a, mpsc::Receiver<Vec<u8>>> {
        Box::pin(async move {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            if self.subscribe_fails {
                return Err(BleError::Bluetooth("descriptor write failed".into()));
            }
            let values = characteristic.notifications.clone();
            let (tx, rx) = mpsc::channel(values.len().max(1));
            tokio::spawn(async move {
                for value in values {
                    if tx.send(value).await.is_err() {
                        break;
                    }
                }
                // Dropping `tx` here models link loss
            });
            Ok(rx)
        })
    }

    fn read_once<'a>(
        &'a self,
        characteristic: &'a Arc<FakeCharacteristic>,
    ) -> BleFuture<'a, Vec<u8>> {
        Box::pin(async move {
            characteristic
                .reads
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| BleError::Bluetooth("read failed".into()))
        })
    }
}

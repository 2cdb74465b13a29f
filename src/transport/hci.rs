//! Raw HCI socket backend for passive advertisement listening.
//!
//! This backend uses raw Linux HCI sockets to run an LE passive scan without
//! going through the BlueZ daemon. It requires CAP_NET_RAW and CAP_NET_ADMIN
//! capabilities or root privileges. It cannot connect to devices.

use super::{
    AdvertisementRecord, AdvertisementSource, BleError, BleFuture, EVENT_CHANNEL_BUFFER_SIZE,
    uuid_from_short,
};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, warn};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use uuid::Uuid;

/// HCI device scanned when none is configured (`hci0`).
pub const DEFAULT_HCI_DEVICE: u16 = 0;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
const AD_TYPE_UUID32_INCOMPLETE: u8 = 0x04;
const AD_TYPE_UUID32_COMPLETE: u8 = 0x05;
const AD_TYPE_UUID128_INCOMPLETE: u8 = 0x06;
const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;

/// Bytes per report before the AD data: event_type, addr_type, addr(6), data_len
const REPORT_HEADER_LEN: usize = 9;

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket
fn open_hci_socket() -> Result<OwnedFd, BleError> {
    // SOCK_NONBLOCK is required for AsyncFd to work properly
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(BleError::AdapterUnavailable(format!(
            "Failed to create HCI socket: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> Result<(), BleError> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(BleError::AdapterUnavailable(format!(
            "Failed to bind HCI socket to hci{}: {}",
            dev_id,
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Set HCI socket filter
fn set_hci_filter(fd: &OwnedFd) -> Result<(), BleError> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(BleError::Bluetooth(format!(
            "Failed to set HCI filter: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> Result<(), BleError> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(BleError::Bluetooth(format!(
            "Failed to send HCI command: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Configure a passive LE scan and enable it
fn configure_le_scan(fd: &OwnedFd) -> Result<(), BleError> {
    // Passive scan, 10ms interval, 10ms window
    let params = LeSetScanParametersCmd {
        scan_type: LE_SCAN_PASSIVE,
        interval: 0x0010, // 10ms in 0.625ms units
        window: 0x0010,   // 10ms in 0.625ms units
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };

    let params_bytes = unsafe {
        std::slice::from_raw_parts(
            &params as *const LeSetScanParametersCmd as *const u8,
            mem::size_of::<LeSetScanParametersCmd>(),
        )
    };

    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, params_bytes);
    send_hci_command(fd, &packet)?;

    set_scan_enable(fd, true)
}

/// Enable or disable LE scanning. Duplicates are never filtered.
fn set_scan_enable(fd: &OwnedFd, enable: bool) -> Result<(), BleError> {
    let packet = hci_command_packet(
        OGF_LE_CTL,
        OCF_LE_SET_SCAN_ENABLE,
        &[u8::from(enable), 0x00],
    );
    send_hci_command(fd, &packet)
}

/// Collect `width`-byte little-endian UUIDs from an AD payload.
fn push_uuids(payload: &[u8], width: usize, uuids: &mut std::collections::BTreeSet<Uuid>) {
    for chunk in payload.chunks_exact(width) {
        let uuid = match width {
            2 => uuid_from_short(u32::from(u16::from_le_bytes([chunk[0], chunk[1]]))),
            4 => uuid_from_short(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            _ => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(chunk);
                Uuid::from_u128(u128::from_le_bytes(bytes))
            }
        };
        uuids.insert(uuid);
    }
}

/// Parse AD structures into the name and service UUID fields of `record`.
fn parse_ad_structures(ad_data: &[u8], record: &mut AdvertisementRecord) {
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        let payload = &ad_data[offset + 2..offset + 1 + len];

        match ad_type {
            AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                push_uuids(payload, 2, &mut record.service_uuids)
            }
            AD_TYPE_UUID32_INCOMPLETE | AD_TYPE_UUID32_COMPLETE => {
                push_uuids(payload, 4, &mut record.service_uuids)
            }
            AD_TYPE_UUID128_INCOMPLETE | AD_TYPE_UUID128_COMPLETE => {
                push_uuids(payload, 16, &mut record.service_uuids)
            }
            // A complete name wins over a shortened one
            AD_TYPE_COMPLETE_NAME => {
                record.local_name = String::from_utf8_lossy(payload).into_owned();
            }
            AD_TYPE_SHORT_NAME if record.local_name.is_empty() => {
                record.local_name = String::from_utf8_lossy(payload).into_owned();
            }
            _ => {}
        }

        offset += 1 + len;
    }
}

/// Parse an LE advertising report event into one record per report.
///
/// `data` is the whole HCI event packet, starting with the packet type byte.
fn parse_advertising_report(data: &[u8]) -> Vec<AdvertisementRecord> {
    // HCI header: packet type, event code, parameter length, subevent
    let Some(report) = data.get(4..) else {
        return Vec::new();
    };
    let Some((&num_reports, mut rest)) = report.split_first() else {
        return Vec::new();
    };

    let mut records = Vec::with_capacity(num_reports as usize);
    for _ in 0..num_reports {
        if rest.len() < REPORT_HEADER_LEN {
            break;
        }

        // Address is little-endian on the wire
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        let data_len = rest[8] as usize;

        let Some(ad_data) = rest.get(REPORT_HEADER_LEN..REPORT_HEADER_LEN + data_len) else {
            break;
        };

        let mut record = AdvertisementRecord {
            address: MacAddress::from_le_bytes(addr),
            ..Default::default()
        };
        parse_ad_structures(ad_data, &mut record);
        records.push(record);

        // Skip the trailing RSSI byte
        rest = rest.get(REPORT_HEADER_LEN + data_len + 1..).unwrap_or(&[]);
    }

    records
}

/// Passive listener on a local HCI device.
#[derive(Debug, Clone, Copy)]
pub struct HciListener {
    dev_id: u16,
}

impl HciListener {
    pub fn new(dev_id: u16) -> Self {
        Self { dev_id }
    }
}

impl AdvertisementSource for HciListener {
    fn advertisements(&self) -> BleFuture<'_, mpsc::Receiver<AdvertisementRecord>> {
        Box::pin(async move { start_listen(self.dev_id) })
    }
}

/// Open the HCI device, start the passive scan and forward every advertisement.
///
/// Scanning is disabled again once the returned receiver is dropped.
fn start_listen(dev_id: u16) -> Result<mpsc::Receiver<AdvertisementRecord>, BleError> {
    let fd = open_hci_socket()?;
    bind_hci_socket(&fd, dev_id)?;
    set_hci_filter(&fd)?;

    // Separate socket for sending commands
    let cmd_fd = open_hci_socket()?;
    bind_hci_socket(&cmd_fd, dev_id)?;
    configure_le_scan(&cmd_fd)?;

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

    let async_fd = AsyncFd::new(fd)
        .map_err(|e| BleError::Bluetooth(format!("Failed to create async fd: {}", e)))?;

    tokio::spawn(async move {
        let mut buf = [0u8; 258]; // Max HCI event size

        'events: loop {
            let mut guard = tokio::select! {
                _ = tx.closed() => break,
                ready = async_fd.readable() => match ready {
                    Ok(guard) => guard,
                    Err(_) => break,
                },
            };

            // Drain all available packets before waiting again
            loop {
                let n = match guard.try_io(|inner| {
                    let ret = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut c_void,
                            buf.len(),
                        )
                    };
                    if ret < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(ret as usize)
                    }
                }) {
                    Ok(Ok(n)) if n > 0 => n,
                    Ok(Ok(_)) => break,  // EOF or empty read
                    Ok(Err(_)) => break, // Read error
                    Err(_) => break,     // WouldBlock - no more data
                };

                if n >= 4
                    && buf[0] == HCI_EVENT_PKT
                    && buf[1] == EVT_LE_META_EVENT
                    && buf[3] == EVT_LE_ADVERTISING_REPORT
                {
                    for record in parse_advertising_report(&buf[..n]) {
                        if tx.send(record).await.is_err() {
                            break 'events;
                        }
                    }
                }
            }
        }

        match set_scan_enable(&cmd_fd, false) {
            Ok(()) => debug!("hci{dev_id}: passive scan stopped"),
            Err(e) => warn!("hci{dev_id}: failed to stop scan: {e}"),
        }
    });

    Ok(rx)
}

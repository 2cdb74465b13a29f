//! Session establishment and the value feed.
//!
//! Connect, resolve the service, resolve the characteristic, then arm either a
//! notification subscription or a poll timer. Each step starts only after the
//! previous one succeeded; any failure ends the run. Only the first resolved
//! service and characteristic are used.

use crate::config::Mode;
use crate::recorder::Recorder;
use crate::transport::{BleError, Central, DiscoveredDevice};
use log::{error, info, warn};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to connect to {device}: {source}")]
    Connect {
        device: String,
        #[source]
        source: BleError,
    },
    #[error("Service access failed: {service} not found")]
    ServiceNotFound { service: Uuid },
    #[error("Service access failed: {0}")]
    ServiceAccess(#[source] BleError),
    #[error("Characteristic access failed: {characteristic} not found")]
    CharacteristicNotFound { characteristic: Uuid },
    #[error("Characteristic access failed: {0}")]
    CharacteristicAccess(#[source] BleError),
    #[error("failed to enable notifications: {0}")]
    Subscribe(#[source] BleError),
    #[error("notification stream closed, link to the device lost")]
    LinkLost,
}

impl SessionError {
    /// Service or characteristic resolution failed (wrong UUID or incompatible device).
    pub fn is_resolution_failure(&self) -> bool {
        matches!(
            self,
            SessionError::ServiceNotFound { .. }
                | SessionError::ServiceAccess(_)
                | SessionError::CharacteristicNotFound { .. }
                | SessionError::CharacteristicAccess(_)
        )
    }
}

/// Where the recorder's input comes from.
pub enum Feed {
    Notify(mpsc::Receiver<Vec<u8>>),
    Poll(Interval),
}

/// A live link with a resolved characteristic and an armed feed.
pub struct Session<C: Central> {
    device: DiscoveredDevice,
    // Held for the lifetime of the session; never explicitly disconnected
    _connection: C::Connection,
    _service: C::Service,
    characteristic: C::Characteristic,
    feed: Feed,
}

/// Build a session for `device`, resolving `service` and then `characteristic`.
pub async fn establish<C: Central>(
    central: &C,
    device: DiscoveredDevice,
    service: Uuid,
    characteristic: Uuid,
    mode: Mode,
) -> Result<Session<C>, SessionError> {
    info!("connecting to {} ({})", device.address, device.name);
    let connection = central
        .connect(&device)
        .await
        .map_err(|source| SessionError::Connect {
            device: device.address.to_string(),
            source,
        })?;

    let service_handle = central
        .resolve_services(&connection, service)
        .await
        .map_err(SessionError::ServiceAccess)?
        .into_iter()
        .next()
        .ok_or(SessionError::ServiceNotFound { service })?;

    let characteristic_handle = central
        .resolve_characteristics(&service_handle, characteristic)
        .await
        .map_err(SessionError::CharacteristicAccess)?
        .into_iter()
        .next()
        .ok_or(SessionError::CharacteristicNotFound { characteristic })?;

    let feed = match mode {
        Mode::Notify => {
            let values = central
                .subscribe_notify(&characteristic_handle)
                .await
                .map_err(SessionError::Subscribe)?;
            info!("notifications enabled on {characteristic}");
            Feed::Notify(values)
        }
        Mode::Poll(period) => {
            info!("polling {characteristic} every {period:?}");
            Feed::Poll(poll_interval(period))
        }
    };

    Ok(Session {
        device,
        _connection: connection,
        _service: service_handle,
        characteristic: characteristic_handle,
        feed,
    })
}

fn poll_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Hand one value to the recorder; failures only affect this sample.
fn record_value(recorder: &Recorder, raw: &[u8]) {
    if let Err(e) = recorder.record(raw) {
        error!("{e}");
    }
}

impl<C: Central> Session<C> {
    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    /// Feed values to `recorder` until the link is lost.
    ///
    /// In poll mode this only returns if the surrounding task is cancelled.
    pub async fn run(self, central: &C, recorder: &Recorder) -> Result<(), SessionError> {
        match self.feed {
            Feed::Notify(mut values) => {
                while let Some(value) = values.recv().await {
                    record_value(recorder, &value);
                }
                Err(SessionError::LinkLost)
            }
            Feed::Poll(mut ticker) => loop {
                ticker.tick().await;
                match central.read_once(&self.characteristic).await {
                    Ok(value) => record_value(recorder, &value),
                    Err(e) => warn!("read of {} failed: {e}", self.device.address),
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::LogFile;
    use crate::output::ValueFormat;
    use crate::test_utils::{
        FakeCentral, FakeCharacteristic, FakeService, SharedBuffer, TEST_MAC, device,
        temp_log_path,
    };
    use crate::transport::uuid_from_short;
    use std::fs;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn service_uuid() -> Uuid {
        uuid_from_short(0x180D)
    }

    fn characteristic_uuid() -> Uuid {
        uuid_from_short(0x2A37)
    }

    fn central_with(characteristic: FakeCharacteristic) -> FakeCentral {
        FakeCentral::new(vec![FakeService {
            uuid: service_uuid(),
            characteristics: vec![Arc::new(characteristic)],
        }])
    }

    async fn establish_default(
        central: &FakeCentral,
        mode: Mode,
    ) -> Result<Session<FakeCentral>, SessionError> {
        establish(
            central,
            device(TEST_MAC, "Sensor"),
            service_uuid(),
            characteristic_uuid(),
            mode,
        )
        .await
    }

    fn recorder(name: &str, format: ValueFormat) -> (Recorder, SharedBuffer, std::path::PathBuf) {
        let path = temp_log_path(name);
        let console = SharedBuffer::default();
        let recorder =
            Recorder::with_console(LogFile::new(&path), format, Box::new(console.clone()));
        (recorder, console, path)
    }

    #[tokio::test]
    async fn establish_notify_subscribes_once() {
        let central = central_with(FakeCharacteristic::new(characteristic_uuid()));
        let session = establish_default(&central, Mode::Notify).await.unwrap();

        assert_eq!(session.device().address, TEST_MAC);
        assert_eq!(central.connects.load(Ordering::SeqCst), 1);
        assert_eq!(central.service_resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(central.characteristic_resolutions.load(Ordering::SeqCst), 1);
        assert_eq!(central.subscriptions.load(Ordering::SeqCst), 1);
        assert!(matches!(session.feed, Feed::Notify(_)));
    }

    #[tokio::test]
    async fn establish_poll_does_not_subscribe() {
        let central = central_with(FakeCharacteristic::new(characteristic_uuid()));
        let session = establish_default(&central, Mode::Poll(Duration::from_millis(100)))
            .await
            .unwrap();

        assert_eq!(central.subscriptions.load(Ordering::SeqCst), 0);
        assert!(matches!(session.feed, Feed::Poll(_)));
    }

    #[tokio::test]
    async fn connect_failure_stops_pipeline() {
        let mut central = central_with(FakeCharacteristic::new(characteristic_uuid()));
        central.connect_fails = true;

        let err = establish_default(&central, Mode::Notify)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Connect { .. }));
        assert!(!err.is_resolution_failure());
        assert_eq!(central.service_resolutions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_service_skips_characteristic_resolution() {
        let central = FakeCentral::new(vec![FakeService {
            uuid: uuid_from_short(0x180F),
            characteristics: Vec::new(),
        }]);

        let err = establish_default(&central, Mode::Notify)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::ServiceNotFound { .. }));
        assert!(err.is_resolution_failure());
        assert_eq!(central.characteristic_resolutions.load(Ordering::SeqCst), 0);
        assert_eq!(central.subscriptions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn service_resolution_error_is_resolution_failure() {
        let mut central = central_with(FakeCharacteristic::new(characteristic_uuid()));
        central.service_resolution_fails = true;

        let err = establish_default(&central, Mode::Notify)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::ServiceAccess(_)));
        assert!(err.is_resolution_failure());
        assert_eq!(central.characteristic_resolutions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn characteristic_failure_reports_access_failed() {
        let mut central = central_with(FakeCharacteristic::new(characteristic_uuid()));
        central.characteristic_resolution_fails = true;

        let err = establish_default(&central, Mode::Notify)
            .await
            .err()
            .unwrap();
        assert!(err.is_resolution_failure());
        assert!(err.to_string().starts_with("Characteristic access failed"));
        assert_eq!(central.subscriptions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_characteristic_is_resolution_failure() {
        let central = central_with(FakeCharacteristic::new(uuid_from_short(0x2A19)));

        let err = establish_default(&central, Mode::Notify)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::CharacteristicNotFound { .. }));
        assert!(err.is_resolution_failure());
    }

    #[tokio::test]
    async fn subscribe_failure_is_reported() {
        let mut central = central_with(FakeCharacteristic::new(characteristic_uuid()));
        central.subscribe_fails = true;

        let err = establish_default(&central, Mode::Notify)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::Subscribe(_)));
        assert!(!err.is_resolution_failure());
    }

    #[tokio::test]
    async fn first_service_and_characteristic_are_used() {
        let first = Arc::new(
            FakeCharacteristic::new(characteristic_uuid()).with_notifications(vec![vec![0x01]]),
        );
        let second = Arc::new(
            FakeCharacteristic::new(characteristic_uuid()).with_notifications(vec![vec![0x02]]),
        );
        let central = FakeCentral::new(vec![
            FakeService {
                uuid: service_uuid(),
                characteristics: vec![first, Arc::clone(&second)],
            },
            FakeService {
                uuid: service_uuid(),
                characteristics: vec![second],
            },
        ]);
        let (recorder, console, path) = recorder("session_first", ValueFormat::Hex);

        let session = establish_default(&central, Mode::Notify).await.unwrap();
        let _ = session.run(&central, &recorder).await;

        let contents = console.contents();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.trim_end().ends_with(", 1"));
        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn notify_records_every_value_then_reports_link_loss() {
        let central = central_with(
            FakeCharacteristic::new(characteristic_uuid()).with_notifications(vec![
                vec![0x01, 0x00, 0x00, 0x00],
                vec![0x01, 0x02], // too short, skipped
                vec![0xFF, 0xFF, 0xFF, 0xFF],
            ]),
        );
        let (recorder, console, path) = recorder("session_notify", ValueFormat::Int32);

        let session = establish_default(&central, Mode::Notify).await.unwrap();
        let err = session.run(&central, &recorder).await.unwrap_err();

        assert!(matches!(err, SessionError::LinkLost));
        let contents = fs::read_to_string(&path).unwrap();
        let values: Vec<&str> = contents
            .lines()
            .map(|line| line.rsplit(", ").next().unwrap())
            .collect();
        assert_eq!(values, vec!["1", "-1"]);
        assert_eq!(console.contents(), contents);
        let _ = fs::remove_file(&path);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_reads_on_every_tick() {
        let central = central_with(
            FakeCharacteristic::new(characteristic_uuid()).with_reads(vec![
                vec![0x0A],
                vec![0x0B],
                vec![0x0C],
            ]),
        );
        let (recorder, console, path) = recorder("session_poll", ValueFormat::Hex);

        let session = establish_default(&central, Mode::Poll(Duration::from_secs(1)))
            .await
            .unwrap();

        // Ticks at 0s, 1s, 2s, 3s, 4s; reads after the third fail and are skipped
        let run = session.run(&central, &recorder);
        let result = tokio::time::timeout(Duration::from_millis(4500), run).await;
        assert!(result.is_err(), "poll mode runs until cancelled");

        let values: Vec<String> = console
            .contents()
            .lines()
            .map(|line| line.rsplit(", ").next().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["a", "b", "c"]);
        let _ = fs::remove_file(&path);
    }
}

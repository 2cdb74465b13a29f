//! Passive advertisement listener.
//!
//! Reports every advertisement in range for a bounded window, without any
//! filtering. Independent of the session pipeline.

use crate::transport::{AdvertisementRecord, AdvertisementSource, BleError};
use log::debug;
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListenError {
    #[error(transparent)]
    Ble(#[from] BleError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Write one advertisement as a console block.
fn write_record(out: &mut dyn Write, record: &AdvertisementRecord) -> io::Result<()> {
    writeln!(out, "MAC:{}", record.address.to_u64())?;
    writeln!(out, "NAME:{}", record.local_name)?;
    writeln!(out, "ServiceUuid")?;
    for uuid in &record.service_uuids {
        writeln!(out, "{uuid}")?;
    }
    writeln!(out)
}

/// Report advertisements from `source` to `out` until `window` has elapsed.
///
/// Scanning stops when this returns. Returns how many advertisements were reported.
pub async fn listen(
    source: &dyn AdvertisementSource,
    window: Duration,
    out: &mut dyn Write,
) -> Result<usize, ListenError> {
    writeln!(out, "Listening for advertise")?;

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    let mut advertisements = source.advertisements().await?;
    let mut reported = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => break,
            record = advertisements.recv() => match record {
                Some(record) => {
                    write_record(out, &record)?;
                    reported += 1;
                }
                None => {
                    debug!("advertisement source closed before the listen window ended");
                    break;
                }
            },
        }
    }

    // Dropping the receiver stops the scan
    drop(advertisements);
    out.flush()?;
    debug!("listen window over, {reported} advertisements reported");
    Ok(reported)
}

//! GATT notification transport for AirBeam3 and AirBeamMini.
//!
//! Opening the transport connects to the peripheral, discovers services,
//! sets the sensor clock, switches it to streaming mode and subscribes to
//! every measurement characteristic of the family. Each notification value
//! is one text line for the decoder.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::StreamExt;
use futures::future::ready;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use airtrack_types::uuid::{
    AIRBEAM_CONFIGURATION, CMD_SET_TIME_PREFIX, CMD_STREAMING_MODE, CMD_TERMINATOR,
};
use airtrack_types::{DeviceFamily, TransportKind};

use crate::error::{Error, Result, TransportFailure};
use crate::scan::{find_peripheral, get_adapter};
use crate::transport::{PayloadStream, Transport};

/// Pause between handshake steps; the sensor drops commands sent back to back.
const COMMAND_PAUSE: Duration = Duration::from_millis(100);

/// Transport streaming text lines from GATT notifications.
pub struct GattTransport {
    address: String,
    family: DeviceFamily,
    scan_duration: Duration,
    peripheral: Mutex<Option<Peripheral>>,
}

impl GattTransport {
    /// Create a transport for the device at `address`.
    pub fn new(address: impl Into<String>, family: DeviceFamily, scan_duration: Duration) -> Self {
        Self {
            address: address.into(),
            family,
            scan_duration,
            peripheral: Mutex::new(None),
        }
    }

    async fn handshake(&self, peripheral: &Peripheral) -> Result<()> {
        let services = peripheral.services();
        let characteristics: HashMap<Uuid, Characteristic> = services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .map(|c| (c.uuid, c.clone()))
            .collect();
        let find = |uuid: Uuid| {
            characteristics
                .get(&uuid)
                .cloned()
                .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), services.len()))
        };

        let configuration = find(AIRBEAM_CONFIGURATION)?;
        let clock = time_command(&self.address, OffsetDateTime::now_utc())?;
        peripheral
            .write(&configuration, &clock, WriteType::WithResponse)
            .await?;
        sleep(COMMAND_PAUSE).await;

        peripheral
            .write(&configuration, &CMD_STREAMING_MODE, WriteType::WithResponse)
            .await?;

        for uuid in self.family.measurement_characteristics() {
            sleep(COMMAND_PAUSE).await;
            let characteristic = find(*uuid)?;
            peripheral.subscribe(&characteristic).await?;
            debug!("Subscribed to {} on {}", uuid, self.address);
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for GattTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Gatt
    }

    async fn open(&self) -> Result<PayloadStream> {
        let adapter = get_adapter().await?;
        let peripheral = find_peripheral(&adapter, &self.address, self.scan_duration).await?;

        info!("Connecting to {} ({})", self.address, self.family);
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        *self.peripheral.lock().await = Some(peripheral.clone());

        if let Err(e) = self.handshake(&peripheral).await {
            warn!("Handshake with {} failed: {}", self.address, e);
            self.close().await?;
            return Err(e);
        }

        let wanted = self.family.measurement_characteristics().to_vec();
        let values = peripheral
            .notifications()
            .await?
            .filter_map(move |n| ready(wanted.contains(&n.uuid).then_some(Ok(n.value))));

        let peripheral_id = peripheral.id();
        let address = self.address.clone();
        let drops = adapter.events().await?.filter_map(move |event| {
            ready(match event {
                CentralEvent::DeviceDisconnected(id) if id == peripheral_id => Some(Err(
                    Error::transport(address.clone(), TransportFailure::LinkLost),
                )),
                _ => None,
            })
        });

        Ok(futures::stream::select(values, drops).boxed())
    }

    async fn close(&self) -> Result<()> {
        let Some(peripheral) = self.peripheral.lock().await.take() else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Disconnecting from {}", self.address);
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}

/// Build the set-clock command: prefix, `dd/MM/yy-HH:mm:ss`, terminator.
pub(crate) fn time_command(address: &str, now: OffsetDateTime) -> Result<Vec<u8>> {
    let format = format_description!("[day]/[month]/[year repr:last_two]-[hour]:[minute]:[second]");
    let stamp = now
        .format(format)
        .map_err(|e| Error::transport_str(address, format!("cannot format clock: {e}")))?;

    let mut command = Vec::with_capacity(CMD_SET_TIME_PREFIX.len() + stamp.len() + 1);
    command.extend_from_slice(&CMD_SET_TIME_PREFIX);
    command.extend_from_slice(stamp.as_bytes());
    command.push(CMD_TERMINATOR);
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_time_command_layout() {
        let command = time_command("AA", datetime!(2024-03-07 09:05:01 UTC)).unwrap();
        assert_eq!(&command[..2], &[0xFE, 0x08]);
        assert_eq!(&command[2..command.len() - 1], b"07/03/24-09:05:01");
        assert_eq!(command.last(), Some(&0xFF));
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let transport = GattTransport::new("AA", DeviceFamily::AirBeam3, Duration::from_secs(1));
        assert_eq!(transport.kind(), TransportKind::Gatt);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires BLE hardware"]
    async fn test_open_airbeam3() {
        let address = std::env::var("AIRBEAM3_ADDRESS").unwrap();
        let transport =
            GattTransport::new(address, DeviceFamily::AirBeam3, Duration::from_secs(10));
        let mut stream = transport.open().await.unwrap();
        let payload = stream.next().await.unwrap().unwrap();
        assert!(std::str::from_utf8(&payload).unwrap().contains("AirBeam3"));
        transport.close().await.unwrap();
    }
}

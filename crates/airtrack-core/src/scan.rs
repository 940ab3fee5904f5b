//! Device discovery and scanning.
//!
//! This module scans for AirBeam and RuuviTag sensors using Bluetooth Low
//! Energy and locates peripherals by address for the GATT and advertisement
//! transports.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info};

use airtrack_types::DeviceFamily;
use airtrack_types::uuid::{AIRBEAM_SERVICE, RUUVI_MANUFACTURER_ID};

use crate::error::{Error, Result, TransportFailure};
use crate::util::{create_identifier, format_peripheral_id};

/// Information about a discovered sensor.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// The advertised name (e.g. "AirBeam3:0018961057a2").
    pub name: Option<String>,
    /// The peripheral ID for connecting.
    #[serde(skip)]
    pub id: PeripheralId,
    /// A connection identifier (peripheral ID on macOS, address on other platforms).
    pub identifier: String,
    /// RSSI signal strength.
    pub rssi: Option<i16>,
    /// Family detected from the name or advertisement.
    pub family: Option<DeviceFamily>,
}

/// Options for scanning.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to scan for devices.
    pub duration: Duration,
    /// Only return devices whose family could be identified.
    pub known_families_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            known_families_only: true,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Scan for all BLE devices, not just known sensor families.
    #[must_use]
    pub fn all_devices(mut self) -> Self {
        self.known_families_only = false;
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::transport("adapter", TransportFailure::AdapterUnavailable))
}

/// Scan for devices with custom options.
pub async fn scan_with_options(options: ScanOptions) -> Result<Vec<DiscoveredDevice>> {
    let adapter = get_adapter().await?;

    info!(
        "Starting BLE scan for {} seconds...",
        options.duration.as_secs()
    );

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(options.duration).await;
    adapter.stop_scan().await?;

    let peripherals = adapter.peripherals().await?;
    let mut discovered = Vec::new();

    for peripheral in peripherals {
        match process_peripheral(&peripheral, options.known_families_only).await {
            Ok(Some(device)) => {
                info!("Found sensor: {:?}", device.name);
                discovered.push(device);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Error processing peripheral: {}", e);
            }
        }
    }

    info!("Scan complete. Found {} device(s)", discovered.len());
    Ok(discovered)
}

async fn process_peripheral(
    peripheral: &Peripheral,
    known_families_only: bool,
) -> Result<Option<DiscoveredDevice>> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    let family = detect_family(&properties);
    if known_families_only && family.is_none() {
        return Ok(None);
    }

    let id = peripheral.id();
    let identifier = create_identifier(&properties.address.to_string(), &id);

    Ok(Some(DiscoveredDevice {
        name: properties.local_name.clone(),
        id,
        identifier,
        rssi: properties.rssi,
        family,
    }))
}

/// Detect the family of a peripheral from its advertisement.
fn detect_family(properties: &PeripheralProperties) -> Option<DeviceFamily> {
    if let Some(family) = properties
        .local_name
        .as_deref()
        .and_then(DeviceFamily::from_name)
    {
        return Some(family);
    }

    if properties
        .manufacturer_data
        .contains_key(&RUUVI_MANUFACTURER_ID)
    {
        return Some(DeviceFamily::RuuviTag);
    }

    if properties.services.contains(&AIRBEAM_SERVICE) {
        return Some(DeviceFamily::AirBeam3);
    }

    None
}

/// Find a peripheral by address, scanning for `scan_duration` if the adapter
/// does not know it yet.
pub async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    scan_duration: Duration,
) -> Result<Peripheral> {
    if let Some(peripheral) = find_peripheral_by_identifier(adapter, address).await? {
        debug!("Found {} in adapter cache", address);
        return Ok(peripheral);
    }

    adapter.start_scan(ScanFilter::default()).await?;
    sleep(scan_duration).await;
    adapter.stop_scan().await?;

    find_peripheral_by_identifier(adapter, address)
        .await?
        .ok_or_else(|| Error::device_not_found(address))
}

/// Search through known peripherals to find one matching the identifier.
///
/// Matches the Bluetooth address (with or without separators) or, on
/// platforms that hide addresses, the peripheral ID.
pub async fn find_peripheral_by_identifier(
    adapter: &Adapter,
    identifier: &str,
) -> Result<Option<Peripheral>> {
    let identifier = identifier.to_lowercase();
    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        if let Ok(Some(props)) = peripheral.properties().await {
            let address = props.address.to_string().to_lowercase();
            let peripheral_id = format_peripheral_id(&peripheral.id()).to_lowercase();

            if peripheral_id == identifier {
                debug!("Matched by peripheral ID: {}", peripheral_id);
                return Ok(Some(peripheral));
            }

            if address != "00:00:00:00:00:00" && addresses_match(&address, &identifier) {
                debug!("Matched by address: {}", address);
                return Ok(Some(peripheral));
            }
        }
    }

    Ok(None)
}

/// Compare two addresses ignoring case and separators.
pub(crate) fn addresses_match(a: &str, b: &str) -> bool {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_lowercase())
            .collect::<String>()
    };
    let (a, b) = (normalize(a), normalize(b));
    !a.is_empty() && a == b
}

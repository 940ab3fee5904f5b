//! Bluetooth identifiers for supported sensor families.
//!
//! AirBeam3 and AirBeamMini share one GATT service; each measurement has its
//! own notifying characteristic. AirBeam2 is reached over the classic Serial
//! Port Profile. RuuviTags are read from manufacturer-specific advertisement
//! data only.

use uuid::{Uuid, uuid};

// --- AirBeam GATT service ---

/// AirBeam custom service UUID.
pub const AIRBEAM_SERVICE: Uuid = uuid!("0000ffdd-0000-1000-8000-00805f9b34fb");

/// Configuration characteristic (time sync and streaming-mode commands).
pub const AIRBEAM_CONFIGURATION: Uuid = uuid!("0000ffde-0000-1000-8000-00805f9b34fb");

/// Temperature line characteristic.
pub const AIRBEAM_TEMPERATURE: Uuid = uuid!("0000ffe1-0000-1000-8000-00805f9b34fb");

/// Relative humidity line characteristic.
pub const AIRBEAM_HUMIDITY: Uuid = uuid!("0000ffe3-0000-1000-8000-00805f9b34fb");

/// PM1 line characteristic.
pub const AIRBEAM_PM1: Uuid = uuid!("0000ffe4-0000-1000-8000-00805f9b34fb");

/// PM2.5 line characteristic.
pub const AIRBEAM_PM2_5: Uuid = uuid!("0000ffe5-0000-1000-8000-00805f9b34fb");

/// PM10 line characteristic.
pub const AIRBEAM_PM10: Uuid = uuid!("0000ffe6-0000-1000-8000-00805f9b34fb");

/// Measurement characteristics exposed by an AirBeam3, in subscription order.
pub const AIRBEAM3_MEASUREMENTS: [Uuid; 5] = [
    AIRBEAM_TEMPERATURE,
    AIRBEAM_HUMIDITY,
    AIRBEAM_PM1,
    AIRBEAM_PM2_5,
    AIRBEAM_PM10,
];

/// Measurement characteristics exposed by an AirBeamMini.
pub const AIRBEAM_MINI_MEASUREMENTS: [Uuid; 2] = [AIRBEAM_PM1, AIRBEAM_PM2_5];

// --- AirBeam configuration commands ---

/// Command prefix for setting the device clock.
pub const CMD_SET_TIME_PREFIX: [u8; 2] = [0xFE, 0x08];

/// Command terminator.
pub const CMD_TERMINATOR: u8 = 0xFF;

/// Switch the device into live streaming mode.
pub const CMD_STREAMING_MODE: [u8; 3] = [0xFE, 0x01, 0xFF];

// --- Classic Bluetooth ---

/// Serial Port Profile UUID used by AirBeam2 RFCOMM sockets.
pub const SERIAL_PORT_PROFILE: Uuid = uuid!("00001101-0000-1000-8000-00805f9b34fb");

// --- RuuviTag ---

/// Ruuvi Innovations manufacturer ID for BLE advertisements.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_characteristics_are_distinct() {
        let mut all = AIRBEAM3_MEASUREMENTS.to_vec();
        all.push(AIRBEAM_CONFIGURATION);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn test_mini_is_subset_of_airbeam3() {
        for uuid in AIRBEAM_MINI_MEASUREMENTS {
            assert!(AIRBEAM3_MEASUREMENTS.contains(&uuid));
        }
    }

    #[test]
    fn test_serial_port_profile_format() {
        assert_eq!(
            SERIAL_PORT_PROFILE.to_string(),
            "00001101-0000-1000-8000-00805f9b34fb"
        );
    }
}

//! Core types for sensor readings, device families and telemetry.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DecodeError;

/// How a device family delivers its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TransportKind {
    /// GATT characteristic notifications carrying text lines.
    Gatt,
    /// Classic Bluetooth RFCOMM serial stream carrying text lines.
    ClassicSocket,
    /// Connectionless manufacturer data in BLE advertisements.
    Advertisement,
}

impl TransportKind {
    /// Whether payloads on this transport are delimited text records.
    #[must_use]
    pub fn is_line_oriented(&self) -> bool {
        !matches!(self, TransportKind::Advertisement)
    }
}

/// Hardware/protocol variant of a sensor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new families
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum DeviceFamily {
    /// AirBeam3: GATT, temperature, humidity and PM1/PM2.5/PM10.
    AirBeam3,
    /// AirBeamMini: GATT, PM1 and PM2.5 only.
    AirBeamMini,
    /// AirBeam2: classic RFCOMM serial socket.
    AirBeam2,
    /// RuuviTag: advertisement-only beacon (RAWv2 frames).
    RuuviTag,
}

impl DeviceFamily {
    /// All known families.
    pub const ALL: [DeviceFamily; 4] = [
        DeviceFamily::AirBeam3,
        DeviceFamily::AirBeamMini,
        DeviceFamily::AirBeam2,
        DeviceFamily::RuuviTag,
    ];

    /// The transport this family is reached over.
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        match self {
            DeviceFamily::AirBeam3 | DeviceFamily::AirBeamMini => TransportKind::Gatt,
            DeviceFamily::AirBeam2 => TransportKind::ClassicSocket,
            DeviceFamily::RuuviTag => TransportKind::Advertisement,
        }
    }

    /// Stable name used in storage, configuration and telemetry.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::AirBeam3 => "AirBeam3",
            DeviceFamily::AirBeamMini => "AirBeamMini",
            DeviceFamily::AirBeam2 => "AirBeam2",
            DeviceFamily::RuuviTag => "RuuviTag",
        }
    }

    /// GATT measurement characteristics to subscribe to, empty for non-GATT families.
    #[must_use]
    pub fn measurement_characteristics(&self) -> &'static [uuid::Uuid] {
        match self {
            DeviceFamily::AirBeam3 => &crate::uuid::AIRBEAM3_MEASUREMENTS,
            DeviceFamily::AirBeamMini => &crate::uuid::AIRBEAM_MINI_MEASUREMENTS,
            DeviceFamily::AirBeam2 | DeviceFamily::RuuviTag => &[],
        }
    }

    /// Detect the family from an advertised device name.
    ///
    /// # Examples
    ///
    /// ```
    /// use airtrack_types::DeviceFamily;
    ///
    /// assert_eq!(DeviceFamily::from_name("AirBeam3:0018961057a2"), Some(DeviceFamily::AirBeam3));
    /// assert_eq!(DeviceFamily::from_name("AirBeamMini:24dcc3a8"), Some(DeviceFamily::AirBeamMini));
    /// assert_eq!(DeviceFamily::from_name("Ruuvi 3F1C"), Some(DeviceFamily::RuuviTag));
    /// assert_eq!(DeviceFamily::from_name("Thingy52 12345"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name_lower = name.to_lowercase();

        if contains_word(&name_lower, "airbeam3") {
            return Some(DeviceFamily::AirBeam3);
        }
        if contains_word(&name_lower, "airbeammini") {
            return Some(DeviceFamily::AirBeamMini);
        }
        if contains_word(&name_lower, "airbeam2") {
            return Some(DeviceFamily::AirBeam2);
        }
        if contains_word(&name_lower, "ruuvi") {
            return Some(DeviceFamily::RuuviTag);
        }

        None
    }

    /// Default human label: family name plus the last four hex digits of the address.
    ///
    /// ```
    /// use airtrack_types::DeviceFamily;
    ///
    /// assert_eq!(DeviceFamily::AirBeam3.default_label("00:18:96:10:57:A2"), "AirBeam3 57A2");
    /// ```
    #[must_use]
    pub fn default_label(&self, address: &str) -> String {
        let digits: String = address.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        let tail = &digits[digits.len().saturating_sub(4)..];
        format!("{} {}", self.as_str(), tail.to_uppercase())
    }
}

/// Check if a string contains a word at a word boundary.
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(pos, _)| {
        let before_ok = haystack[..pos]
            .chars()
            .last()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[pos + needle.len()..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceFamily::ALL
            .into_iter()
            .find(|family| family.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DecodeError::invalid(format!("unknown device family '{s}'")))
    }
}

/// Connection lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No connection has ever been requested.
    #[default]
    None,
    /// Not connected.
    Disconnected,
    /// Transport handshake in progress.
    Connecting,
    /// Transport is up and payloads are flowing.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

impl ConnectionState {
    /// Stable name used in storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::None => "none",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Whether a transport is up or being brought up.
    #[must_use]
    pub fn is_establishing_or_up(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ConnectionState::None),
            "disconnected" => Ok(ConnectionState::Disconnected),
            "connecting" => Ok(ConnectionState::Connecting),
            "connected" => Ok(ConnectionState::Connected),
            "reconnecting" => Ok(ConnectionState::Reconnecting),
            other => Err(DecodeError::invalid(format!(
                "unknown connection state '{other}'"
            ))),
        }
    }
}

/// Physical quantity a reading measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum MeasurementKind {
    /// Air temperature in °C.
    Temperature,
    /// Relative humidity in %.
    Humidity,
    /// Particulate matter below 1 µm in µg/m³.
    Pm1,
    /// Particulate matter below 2.5 µm in µg/m³.
    Pm2_5,
    /// Particulate matter below 10 µm in µg/m³.
    Pm10,
    /// Barometric pressure in hPa.
    Pressure,
}

impl MeasurementKind {
    /// Unit symbol for values of this kind after normalization.
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "°C",
            MeasurementKind::Humidity => "%",
            MeasurementKind::Pm1 | MeasurementKind::Pm2_5 | MeasurementKind::Pm10 => "µg/m³",
            MeasurementKind::Pressure => "hPa",
        }
    }

    /// Stable name used in telemetry payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Temperature => "temperature",
            MeasurementKind::Humidity => "humidity",
            MeasurementKind::Pm1 => "pm1",
            MeasurementKind::Pm2_5 => "pm2_5",
            MeasurementKind::Pm10 => "pm10",
            MeasurementKind::Pressure => "pressure",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position fix from the location provider.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocationFix {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Provider label (e.g. "gps", "gpsd").
    pub provider: String,
    /// When the fix was taken.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Horizontal accuracy in meters.
    pub accuracy: Option<f32>,
    /// Ground speed in m/s.
    pub speed: Option<f32>,
    /// Course over ground in degrees.
    pub bearing: Option<f32>,
    /// Altitude in meters.
    pub altitude: Option<f64>,
}

/// A single typed sensor reading.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Address of the producing device.
    pub sensor_id: String,
    /// Family of the producing device.
    pub family: DeviceFamily,
    /// What is measured.
    pub kind: MeasurementKind,
    /// Normalized value; `None` when the payload value did not parse.
    pub value: Option<f64>,
    /// When the reading was received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Source text for audit (the line, or a hex dump of a binary frame).
    pub raw: String,
    /// Location at the time of the reading.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub location: Option<LocationFix>,
    /// Per-session message sequence number.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none", default))]
    pub sequence: Option<u64>,
}

impl Reading {
    /// Attach a location fix.
    #[must_use]
    pub fn with_location(mut self, location: Option<LocationFix>) -> Self {
        self.location = location;
        self
    }

    /// Attach a sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Periodic liveness report of the collecting host.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Heartbeat {
    /// When the heartbeat was generated.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Persistent application installation id.
    pub app_id: String,
    /// Battery charge in percent, if the host has a battery.
    pub battery_percentage: Option<u8>,
    /// Whether the host is in power-save mode, if known.
    pub power_save: Option<bool>,
}

/// Kind of an outbound telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TelemetryKind {
    /// A sensor reading.
    Reading,
    /// A location fix.
    Location,
    /// A heartbeat.
    Heartbeat,
}

impl TelemetryKind {
    /// Stable name used in storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Reading => "reading",
            TelemetryKind::Location => "location",
            TelemetryKind::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for TelemetryKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reading" => Ok(TelemetryKind::Reading),
            "location" => Ok(TelemetryKind::Location),
            "heartbeat" => Ok(TelemetryKind::Heartbeat),
            other => Err(DecodeError::invalid(format!(
                "unknown telemetry kind '{other}'"
            ))),
        }
    }
}

/// Delivery state of a queued telemetry message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeliveryState {
    /// Waiting to be published.
    Pending,
    /// Handed to the broker, confirmation outstanding.
    InFlight,
    /// Confirmed by the broker.
    Acknowledged,
}

impl DeliveryState {
    /// Stable name used in storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Acknowledged => "acknowledged",
        }
    }
}

impl FromStr for DeliveryState {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "in_flight" => Ok(DeliveryState::InFlight),
            "acknowledged" => Ok(DeliveryState::Acknowledged),
            other => Err(DecodeError::invalid(format!(
                "unknown delivery state '{other}'"
            ))),
        }
    }
}

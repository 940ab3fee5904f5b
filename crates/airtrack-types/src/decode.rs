//! Pure payload decoders for every supported device family.
//!
//! Line-oriented families (AirBeam over GATT or RFCOMM) send one record per
//! line:
//!
//! ```text
//! 12.3;AirBeam3:0018961057a2;AirBeam3-PM2.5;Particulate Matter;PM;...
//! ```
//!
//! Field 0 is the value, field 2 the sensor tag. Temperatures arrive in
//! Fahrenheit and are normalized to Celsius.
//!
//! RuuviTags broadcast RAWv2 (data format 5) frames in manufacturer data,
//! each carrying temperature, humidity and pressure at once.

use time::OffsetDateTime;

use crate::error::{DecodeError, DecodeResult};
use crate::types::{DeviceFamily, MeasurementKind, Reading, TransportKind};

/// Field separator in AirBeam lines.
pub const LINE_SEPARATOR: char = ';';

/// Minimum number of fields in a line (value, package, tag).
pub const MIN_LINE_FIELDS: usize = 3;

/// Data format byte of a RAWv2 frame.
pub const RAWV2_FORMAT: u8 = 0x05;

/// Length of a RAWv2 frame, manufacturer id excluded.
pub const RAWV2_FRAME_BYTES: usize = 24;

const RAWV2_INVALID_TEMPERATURE: i16 = i16::MIN;
const RAWV2_INVALID_U16: u16 = u16::MAX;

/// Decode a raw payload from a device of the given family.
///
/// Line-oriented families yield exactly one reading; advertisement frames
/// yield every co-located measurement in the frame.
///
/// # Errors
///
/// Returns a [`DecodeError`] when the payload is malformed. Callers drop the
/// record; the error never affects the producing connection.
pub fn decode(
    sensor_id: &str,
    family: DeviceFamily,
    payload: &[u8],
    timestamp: OffsetDateTime,
) -> DecodeResult<Vec<Reading>> {
    match family.transport() {
        TransportKind::Gatt | TransportKind::ClassicSocket => {
            let line = std::str::from_utf8(payload)
                .map_err(|e| DecodeError::invalid(format!("line is not UTF-8: {e}")))?;
            decode_line(sensor_id, family, line, timestamp).map(|reading| vec![reading])
        }
        TransportKind::Advertisement => decode_rawv2(sensor_id, family, payload, timestamp),
    }
}

/// Decode a single AirBeam line.
///
/// An unparseable value field is not an error: the reading is produced with
/// a `None` value so the raw text is still available.
///
/// # Errors
///
/// - [`DecodeError::InvalidData`] for empty lines or lines with fewer than
///   [`MIN_LINE_FIELDS`] fields.
/// - [`DecodeError::UnsupportedMeasurementKind`] for unknown sensor tags.
pub fn decode_line(
    sensor_id: &str,
    family: DeviceFamily,
    line: &str,
    timestamp: OffsetDateTime,
) -> DecodeResult<Reading> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DecodeError::invalid("empty line"));
    }

    let fields: Vec<&str> = line.split(LINE_SEPARATOR).collect();
    if fields.len() < MIN_LINE_FIELDS {
        return Err(DecodeError::invalid(format!(
            "expected at least {MIN_LINE_FIELDS} fields, got {}",
            fields.len()
        )));
    }

    let (kind, fahrenheit) = measurement_for_tag(fields[2].trim())?;
    let value = fields[0]
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| if fahrenheit { fahrenheit_to_celsius(v) } else { v });

    Ok(Reading {
        sensor_id: sensor_id.to_string(),
        family,
        kind,
        value,
        timestamp,
        raw: line.to_string(),
        location: None,
        sequence: None,
    })
}

/// Map an AirBeam sensor tag such as `AirBeam3-PM2.5` to a measurement kind.
///
/// The boolean is `true` when the value is reported in Fahrenheit.
fn measurement_for_tag(tag: &str) -> DecodeResult<(MeasurementKind, bool)> {
    let unsupported = || DecodeError::UnsupportedMeasurementKind(tag.to_string());

    let (model, quantity) = tag.split_once('-').ok_or_else(unsupported)?;
    if !model.starts_with("AirBeam") {
        return Err(unsupported());
    }

    match quantity {
        "F" => Ok((MeasurementKind::Temperature, true)),
        "RH" => Ok((MeasurementKind::Humidity, false)),
        "PM1" => Ok((MeasurementKind::Pm1, false)),
        "PM2.5" => Ok((MeasurementKind::Pm2_5, false)),
        "PM10" => Ok((MeasurementKind::Pm10, false)),
        _ => Err(unsupported()),
    }
}

/// Convert a Fahrenheit temperature to Celsius.
#[must_use]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Decode a RuuviTag RAWv2 (data format 5) frame.
///
/// The frame layout (big-endian) is:
/// - byte 0: data format (`0x05`)
/// - bytes 1-2: temperature (i16, 0.005 °C steps)
/// - bytes 3-4: humidity (u16, 0.0025 % steps)
/// - bytes 5-6: pressure (u16, Pa offset by 50000)
/// - bytes 7-23: acceleration, power, movement, sequence, MAC (ignored here)
///
/// Sentinel values mark unavailable measurements and decode to `None`.
/// Pressure is reported in hPa.
///
/// # Errors
///
/// - [`DecodeError::InsufficientBytes`] if the frame is shorter than
///   [`RAWV2_FRAME_BYTES`].
/// - [`DecodeError::UnsupportedFormat`] if byte 0 is not [`RAWV2_FORMAT`].
pub fn decode_rawv2(
    sensor_id: &str,
    family: DeviceFamily,
    frame: &[u8],
    timestamp: OffsetDateTime,
) -> DecodeResult<Vec<Reading>> {
    use bytes::Buf;

    if frame.is_empty() {
        return Err(DecodeError::InsufficientBytes {
            expected: RAWV2_FRAME_BYTES,
            actual: 0,
        });
    }
    if frame[0] != RAWV2_FORMAT {
        return Err(DecodeError::UnsupportedFormat(frame[0]));
    }
    if frame.len() < RAWV2_FRAME_BYTES {
        return Err(DecodeError::InsufficientBytes {
            expected: RAWV2_FRAME_BYTES,
            actual: frame.len(),
        });
    }

    let mut buf = &frame[1..];
    let temperature_raw = buf.get_i16();
    let humidity_raw = buf.get_u16();
    let pressure_raw = buf.get_u16();

    let temperature =
        (temperature_raw != RAWV2_INVALID_TEMPERATURE).then(|| f64::from(temperature_raw) * 0.005);
    let humidity = (humidity_raw != RAWV2_INVALID_U16).then(|| f64::from(humidity_raw) * 0.0025);
    let pressure =
        (pressure_raw != RAWV2_INVALID_U16).then(|| (f64::from(pressure_raw) + 50_000.0) / 100.0);

    let raw = hex(&frame[..RAWV2_FRAME_BYTES]);
    let reading = |kind, value| Reading {
        sensor_id: sensor_id.to_string(),
        family,
        kind,
        value,
        timestamp,
        raw: raw.clone(),
        location: None,
        sequence: None,
    };

    Ok(vec![
        reading(MeasurementKind::Temperature, temperature),
        reading(MeasurementKind::Humidity, humidity),
        reading(MeasurementKind::Pressure, pressure),
    ])
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02X}");
        out
    })
}

//! Settings, battery, button and device-info payloads.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{BatteryReport, DeviceInfo};
use crate::domain::tracker::{AutoCorrection, Fps, SensorMode, TrackerSettings};
use serde::Deserialize;

/// Telemetry payload of a tracker that is searching for its dongle
pub const SEARCHING_PAYLOAD: &str = "7f7f7f7f7f7f";

/// Character offsets inside a settings payload
mod settings_offsets {
    pub const FPS: usize = 5;
    pub const SENSOR_MODE: usize = 6;
    pub const AUTO_CORRECTION: usize = 10;
    pub const ANKLE: usize = 13;
    pub const LEN: usize = 14;
}

/// Character offsets inside a button/acknowledgement payload
mod button_offsets {
    pub const PAIRING_STATUS: usize = 2;
    pub const TRACKER_ID: usize = 4;
    pub const MAIN_BUTTON: usize = 6;
    pub const SUB_BUTTON: usize = 9;
}

/// Pairing status digit reported once a tracker has bound to a port
const PAIRED_SENTINEL: char = '3';

fn hex_digit_at(payload: &str, offset: usize) -> Option<u8> {
    payload
        .chars()
        .nth(offset)
        .and_then(|c| c.to_digit(16))
        .map(|d| d as u8)
}

/// Encode settings as `00000{fps}{mode}010{autoCorrection}00{ankle}`.
pub fn encode_settings(settings: &TrackerSettings) -> String {
    let fps = match settings.fps {
        Fps::Fps50 => 0,
        Fps::Fps100 => 1,
    };
    let mode = match settings.sensor_mode {
        SensorMode::Mode1 => 1,
        SensorMode::Mode2 => 0,
    };
    format!(
        "00000{}{}010{:x}00{}",
        fps,
        mode,
        settings.auto_correction.bitmask(),
        u8::from(settings.ankle_motion_detection)
    )
}

/// Decode an inbound `o` payload.
pub fn decode_settings(payload: &str) -> InterpreterResult<TrackerSettings> {
    let malformed = || InterpreterError::MalformedPacket(format!("settings payload `{}`", payload));

    if payload.len() < settings_offsets::LEN {
        return Err(malformed());
    }

    let fps = match hex_digit_at(payload, settings_offsets::FPS) {
        Some(0) => Fps::Fps50,
        Some(1) => Fps::Fps100,
        _ => return Err(malformed()),
    };
    let sensor_mode = match hex_digit_at(payload, settings_offsets::SENSOR_MODE) {
        Some(0) => SensorMode::Mode2,
        Some(1) => SensorMode::Mode1,
        _ => return Err(malformed()),
    };
    let mask = hex_digit_at(payload, settings_offsets::AUTO_CORRECTION).ok_or_else(malformed)?;
    let ankle = match hex_digit_at(payload, settings_offsets::ANKLE) {
        Some(0) => false,
        Some(1) => true,
        _ => return Err(malformed()),
    };

    Ok(TrackerSettings {
        sensor_mode,
        fps,
        auto_correction: AutoCorrection::from_bitmask(mask),
        ankle_motion_detection: ankle,
    })
}

/// Two-port settings frame: `o0:<hex>\r\no1:<hex>\r\n`.
pub fn settings_lines(port0: &str, port1: &str) -> Vec<String> {
    vec![format!("o0:{}", port0), format!("o1:{}", port1)]
}

#[derive(Debug, Deserialize)]
struct BatteryJson {
    #[serde(rename = "battery remaining")]
    remaining: Option<u8>,
    #[serde(rename = "battery voltage")]
    voltage: Option<u32>,
    #[serde(rename = "charge status")]
    charge_status: Option<String>,
}

/// Decode a dongle `v` payload.
pub fn decode_battery_json(payload: &str) -> InterpreterResult<BatteryReport> {
    let json: BatteryJson = serde_json::from_str(payload)
        .map_err(|e| InterpreterError::MalformedPacket(format!("battery payload: {}", e)))?;
    Ok(BatteryReport {
        percent: json.remaining,
        voltage: json.voltage,
        charge_status: json.charge_status,
    })
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    version: Option<String>,
    model: Option<String>,
    #[serde(rename = "serial no")]
    serial: Option<String>,
}

/// Decode an `i` payload.
pub fn decode_device_info(payload: &str) -> InterpreterResult<DeviceInfo> {
    let json: InfoJson = serde_json::from_str(payload)
        .map_err(|e| InterpreterError::MalformedPacket(format!("device info payload: {}", e)))?;
    Ok(DeviceInfo {
        version: json.version,
        model: json.model,
        serial: json.serial,
        ..Default::default()
    })
}

/// Main and sub button counters from an `r` payload.
pub fn decode_buttons(payload: &str) -> InterpreterResult<(u8, u8)> {
    let main = hex_digit_at(payload, button_offsets::MAIN_BUTTON).ok_or_else(|| {
        InterpreterError::MalformedPacket(format!("button payload `{}`", payload))
    })?;
    let sub = hex_digit_at(payload, button_offsets::SUB_BUTTON).unwrap_or(0);
    Ok((main, sub))
}

/// Tracker id announced in an `r` acknowledgement.
pub fn ack_tracker_id(payload: &str) -> Option<u8> {
    hex_digit_at(payload, button_offsets::TRACKER_ID)
}

/// Whether an `r` payload confirms a completed pairing.
pub fn is_pairing_ack(payload: &str) -> bool {
    payload.chars().nth(button_offsets::PAIRING_STATUS) == Some(PAIRED_SENTINEL)
}

pub fn is_searching(payload: &str) -> bool {
    payload.eq_ignore_ascii_case(SEARCHING_PAYLOAD)
}

/// BLE battery level: one byte, direct percentage.
pub fn decode_ble_battery_level(value: &[u8]) -> InterpreterResult<u8> {
    value
        .first()
        .copied()
        .ok_or_else(|| InterpreterError::MalformedPacket("empty battery level".into()))
}

/// BLE battery voltage: u16 little-endian millivolts.
pub fn decode_ble_voltage(value: &[u8]) -> InterpreterResult<u32> {
    match value {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi]) as u32),
        _ => Err(InterpreterError::MalformedPacket(format!(
            "battery voltage needs 2 bytes, got {}",
            value.len()
        ))),
    }
}

pub fn decode_ble_charge_status(value: &[u8]) -> InterpreterResult<String> {
    let status = match value.first() {
        Some(0) => "discharging",
        Some(1) => "charging",
        Some(2) => "charged",
        Some(other) => return Ok(format!("unknown({})", other)),
        None => {
            return Err(InterpreterError::MalformedPacket(
                "empty charge status".into(),
            ))
        }
    };
    Ok(status.to_string())
}

/// Single-byte BLE value (button counters, settings).
pub fn decode_ble_byte(value: &[u8]) -> InterpreterResult<u8> {
    value
        .first()
        .copied()
        .ok_or_else(|| InterpreterError::MalformedPacket("empty characteristic value".into()))
}

pub fn decode_ble_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_settings_pattern() {
        let settings = TrackerSettings {
            sensor_mode: SensorMode::Mode1,
            fps: Fps::Fps100,
            auto_correction: AutoCorrection {
                accel: true,
                gyro: true,
                mag: false,
            },
            ankle_motion_detection: true,
        };
        assert_eq!(encode_settings(&settings), "00000110103001");
        assert_eq!(encode_settings(&TrackerSettings::default()), "00000000101000");
    }

    #[test]
    fn test_settings_round_trip() {
        let settings = TrackerSettings {
            sensor_mode: SensorMode::Mode1,
            fps: Fps::Fps100,
            auto_correction: AutoCorrection {
                accel: true,
                gyro: true,
                mag: false,
            },
            ankle_motion_detection: true,
        };
        let decoded = decode_settings(&encode_settings(&settings)).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn test_decode_settings_rejects_short_or_invalid() {
        assert!(decode_settings("0000").is_err());
        assert!(decode_settings("00000910103001").is_err());
    }

    #[test]
    fn test_decode_battery_json() {
        let report = decode_battery_json(
            r#"{"battery remaining": 87, "battery voltage": 3921, "charge status": "discharging"}"#,
        )
        .unwrap();
        assert_eq!(report.percent, Some(87));
        assert_eq!(report.voltage, Some(3921));
        assert_eq!(report.charge_status.as_deref(), Some("discharging"));
        assert!(decode_battery_json("{").is_err());
    }

    #[test]
    fn test_decode_device_info() {
        let info =
            decode_device_info(r#"{"version": "1.0.19", "model": "MC2B", "serial no": "ABC123"}"#)
                .unwrap();
        assert_eq!(info.version.as_deref(), Some("1.0.19"));
        assert_eq!(info.serial.as_deref(), Some("ABC123"));
    }

    #[test]
    fn test_button_payload_fields() {
        let payload = "113060a002";
        assert_eq!(decode_buttons(payload).unwrap(), (10, 2));
        assert_eq!(ack_tracker_id(payload), Some(6));
        assert!(is_pairing_ack(payload));
        assert!(!is_pairing_ack("110060800"));
        assert_eq!(decode_buttons("1100608").unwrap(), (8, 0));
        assert!(decode_buttons("11").is_err());
    }

    #[test]
    fn test_ble_values() {
        assert_eq!(decode_ble_voltage(&[0x51, 0x0f]).unwrap(), 3921);
        assert!(decode_ble_voltage(&[1]).is_err());
        assert_eq!(decode_ble_charge_status(&[1]).unwrap(), "charging");
        assert_eq!(decode_ble_string(b"MC2B\0"), "MC2B");
    }
}

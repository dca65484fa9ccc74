//! Outbound Commands
//!
//! Builders for everything the host writes to a channel. Line transports
//! receive `identifier:payload\r\n` lines; BLE trackers receive characteristic
//! reads and writes.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{SubPort, TransportKind};
use crate::domain::tracker::TrackerSettings;
use crate::infrastructure::protocol::gatt::{self, names};
use uuid::Uuid;

/// Baud rate used by every serial transport
pub const BAUD_RATE: u32 = 500_000;

/// Highest radio channel the dongle accepts
pub const MAX_RADIO_CHANNEL: u8 = 10;

pub const LINE_TERMINATOR: &str = "\r\n";

/// One unit of outbound traffic, written in a single channel call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Lines(Vec<String>),
    WriteCharacteristic { characteristic: Uuid, value: Vec<u8> },
    /// The value comes back through the channel's notification stream.
    ReadCharacteristic { characteristic: Uuid },
}

impl Outbound {
    pub fn line(line: impl Into<String>) -> Self {
        Self::Lines(vec![line.into()])
    }

    /// Wire bytes of a line command; empty for GATT operations.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Lines(lines) => lines
                .iter()
                .flat_map(|line| {
                    line.as_bytes()
                        .iter()
                        .chain(LINE_TERMINATOR.as_bytes())
                        .copied()
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn lines(&self) -> &[String] {
        match self {
            Self::Lines(lines) => lines,
            _ => &[],
        }
    }
}

fn read(name: &str) -> Option<Outbound> {
    gatt::characteristic_uuid(name).map(|characteristic| Outbound::ReadCharacteristic { characteristic })
}

fn reads(names: &[&str]) -> Vec<Outbound> {
    names.iter().filter_map(|name| read(name)).collect()
}

fn write(name: &str, value: Vec<u8>) -> Option<Outbound> {
    gatt::characteristic_uuid(name)
        .map(|characteristic| Outbound::WriteCharacteristic { characteristic, value })
}

/// Radio channel as the single hex digit used in `o:` commands.
pub fn radio_channel_digit(channel: u8) -> InterpreterResult<char> {
    if channel > MAX_RADIO_CHANNEL {
        return Err(InterpreterError::InvalidChannelNumber(channel));
    }
    char::from_digit(channel as u32, 16).ok_or(InterpreterError::InvalidChannelNumber(channel))
}

fn tracker_port_digit(subport: SubPort) -> InterpreterResult<&'static str> {
    if !subport.is_tracker_port() {
        return Err(InterpreterError::Unsupported {
            kind: TransportKind::DongleSerial,
            operation: "pairing the dongle port",
        });
    }
    Ok(subport.digit())
}

/// `o:30{ch}0`
pub fn restore_channel(channel: u8) -> InterpreterResult<String> {
    Ok(format!("o:30{}0", radio_channel_digit(channel)?))
}

/// Channel-select, port-activate, channel-restore.
pub fn pair_sequence(subport: SubPort, channel: u8) -> InterpreterResult<Vec<String>> {
    let port = tracker_port_digit(subport)?;
    let ch = radio_channel_digit(channel)?;
    Ok(vec![
        format!("o:30{}0", ch),
        format!("o:1{}{}0", port, ch),
        format!("o:30{}0", ch),
    ])
}

/// Sent once the tracker has acknowledged the pairing.
pub fn finish_pairing_sequence(subport: SubPort, channel: u8) -> InterpreterResult<Vec<String>> {
    let port = tracker_port_digit(subport)?;
    Ok(vec![restore_channel(channel)?, format!("r{}:", port)])
}

/// Deactivate, restore.
pub fn unpair_sequence(subport: SubPort, channel: u8) -> InterpreterResult<Vec<String>> {
    let port = tracker_port_digit(subport)?;
    let ch = radio_channel_digit(channel)?;
    Ok(vec![format!("o:2{}{}0", port, ch), format!("o:30{}0", ch)])
}

/// Identity, button and settings requests sent right after open.
pub fn initial_burst(kind: TransportKind) -> Vec<Outbound> {
    if kind.is_line_protocol() {
        vec![Outbound::Lines(
            ["r0:", "r1:", "o0:", "o1:"].map(String::from).to_vec(),
        )]
    } else {
        reads(&[
            names::MAIN_BUTTON,
            names::SECONDARY_BUTTON,
            names::FPS_SETTING,
            names::SENSOR_MODE_SETTING,
            names::AUTO_CALIBRATION_SETTING,
        ])
    }
}

/// Device info and battery requests of the delayed second burst.
pub fn info_burst(kind: TransportKind) -> Vec<Outbound> {
    if kind.is_line_protocol() {
        vec![Outbound::Lines(
            ["i:", "i0:", "i1:", "v0:", "v1:"].map(String::from).to_vec(),
        )]
    } else {
        reads(&[
            names::MODEL_NUMBER,
            names::SERIAL_NUMBER,
            names::MANUFACTURER,
            names::HARDWARE_REVISION,
            names::FIRMWARE_REVISION,
            names::SOFTWARE_REVISION,
            names::BATTERY_LEVEL,
            names::BATTERY_VOLTAGE,
            names::CHARGE_STATUS,
        ])
    }
}

pub fn heartbeat(kind: TransportKind) -> Option<Outbound> {
    if kind.is_line_protocol() {
        Some(Outbound::line("i:"))
    } else {
        read(names::BATTERY_LEVEL)
    }
}

fn port_request(prefix: char, subport: SubPort) -> Outbound {
    Outbound::line(format!("{}{}:", prefix, subport.digit()))
}

pub fn request_device_info(kind: TransportKind, subport: SubPort) -> Vec<Outbound> {
    if kind.is_line_protocol() {
        vec![port_request('i', subport)]
    } else {
        reads(&[
            names::MODEL_NUMBER,
            names::SERIAL_NUMBER,
            names::MANUFACTURER,
            names::HARDWARE_REVISION,
            names::FIRMWARE_REVISION,
            names::SOFTWARE_REVISION,
        ])
    }
}

pub fn request_battery(kind: TransportKind, subport: SubPort) -> Vec<Outbound> {
    if kind.is_line_protocol() {
        vec![port_request('v', subport)]
    } else {
        reads(&[
            names::BATTERY_LEVEL,
            names::BATTERY_VOLTAGE,
            names::CHARGE_STATUS,
        ])
    }
}

pub fn request_settings(kind: TransportKind, subport: SubPort) -> Vec<Outbound> {
    if kind.is_line_protocol() {
        vec![port_request('o', subport)]
    } else {
        reads(&[
            names::FPS_SETTING,
            names::SENSOR_MODE_SETTING,
            names::AUTO_CALIBRATION_SETTING,
        ])
    }
}

pub fn request_buttons(kind: TransportKind, subport: SubPort) -> Vec<Outbound> {
    if kind.is_line_protocol() {
        vec![port_request('r', subport)]
    } else {
        reads(&[names::MAIN_BUTTON, names::SECONDARY_BUTTON])
    }
}

/// Settings characteristic writes for a BLE tracker.
pub fn ble_settings_writes(settings: &TrackerSettings) -> Vec<Outbound> {
    [
        write(names::FPS_SETTING, vec![settings.fps.rate()]),
        write(
            names::SENSOR_MODE_SETTING,
            vec![settings.sensor_mode.number()],
        ),
        write(
            names::AUTO_CALIBRATION_SETTING,
            vec![settings.auto_correction.bitmask()],
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_crlf_terminated() {
        let cmd = Outbound::Lines(vec!["o0:abc".into(), "o1:def".into()]);
        assert_eq!(cmd.to_bytes(), b"o0:abc\r\no1:def\r\n".to_vec());
    }

    #[test]
    fn test_radio_channel_bounds() {
        assert_eq!(radio_channel_digit(10).unwrap(), 'a');
        assert_eq!(restore_channel(3).unwrap(), "o:3030");
        assert_eq!(
            restore_channel(11),
            Err(InterpreterError::InvalidChannelNumber(11))
        );
    }

    #[test]
    fn test_pair_and_unpair_sequences() {
        assert_eq!(
            pair_sequence(SubPort::Port1, 5).unwrap(),
            vec!["o:3050", "o:1150", "o:3050"]
        );
        assert_eq!(
            unpair_sequence(SubPort::Port0, 5).unwrap(),
            vec!["o:2050", "o:3050"]
        );
        assert_eq!(
            finish_pairing_sequence(SubPort::Port1, 5).unwrap(),
            vec!["o:3050", "r1:"]
        );
        assert!(pair_sequence(SubPort::Dongle, 5).is_err());
    }

    #[test]
    fn test_handshake_bursts_per_transport() {
        assert_eq!(
            initial_burst(TransportKind::DongleSerial)[0].lines(),
            ["r0:", "r1:", "o0:", "o1:"]
        );
        assert_eq!(heartbeat(TransportKind::BtSpp), Some(Outbound::line("i:")));
        assert!(initial_burst(TransportKind::BleGatt)
            .iter()
            .all(|cmd| matches!(cmd, Outbound::ReadCharacteristic { .. })));
        assert!(matches!(
            heartbeat(TransportKind::BleGatt),
            Some(Outbound::ReadCharacteristic { .. })
        ));
    }

    #[test]
    fn test_requests_address_subport() {
        assert_eq!(
            request_battery(TransportKind::DongleSerial, SubPort::Port1),
            vec![Outbound::line("v1:")]
        );
        assert_eq!(
            request_device_info(TransportKind::DongleSerial, SubPort::Dongle),
            vec![Outbound::line("i:")]
        );
    }

    #[test]
    fn test_ble_settings_writes() {
        let writes = ble_settings_writes(&TrackerSettings::default());
        assert_eq!(writes.len(), 3);
        match &writes[0] {
            Outbound::WriteCharacteristic { value, .. } => assert_eq!(value, &vec![50]),
            other => panic!("unexpected {:?}", other),
        }
    }
}

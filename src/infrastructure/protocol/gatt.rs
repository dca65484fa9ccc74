//! BLE GATT surface of the trackers
//!
//! Standard 16-bit services/characteristics are expanded onto the Bluetooth
//! base UUID; the vendor tracker and setting services use full 128-bit UUIDs.

use crate::infrastructure::protocol::frame::FrameKind;
use uuid::Uuid;

/// Advertised-name prefix of the product family
pub const DEVICE_NAME_PREFIX: &str = "HaritoraX";

const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

pub mod names {
    pub const SENSOR: &str = "Sensor";
    pub const MAIN_BUTTON: &str = "MainButton";
    pub const SECONDARY_BUTTON: &str = "SecondaryButton";
    pub const BATTERY_LEVEL: &str = "BatteryLevel";
    pub const BATTERY_VOLTAGE: &str = "BatteryVoltage";
    pub const CHARGE_STATUS: &str = "ChargeStatus";
    pub const FPS_SETTING: &str = "FpsSetting";
    pub const SENSOR_MODE_SETTING: &str = "SensorModeSetting";
    pub const WIRELESS_MODE_SETTING: &str = "WirelessModeSetting";
    pub const AUTO_CALIBRATION_SETTING: &str = "AutoCalibrationSetting";
    pub const SERIAL_NUMBER: &str = "SerialNumber";
    pub const MANUFACTURER: &str = "Manufacturer";
    pub const HARDWARE_REVISION: &str = "HardwareRevision";
    pub const FIRMWARE_REVISION: &str = "FirmwareRevision";
    pub const SOFTWARE_REVISION: &str = "SoftwareRevision";
    pub const MODEL_NUMBER: &str = "ModelNumber";
}

pub const GENERIC_ACCESS_SERVICE: Uuid = short_uuid(0x1800);
pub const DEVICE_INFORMATION_SERVICE: Uuid = short_uuid(0x180a);
pub const BATTERY_SERVICE: Uuid = short_uuid(0x180f);
pub const TRACKER_SERVICE: Uuid = Uuid::from_u128(0x00dbec3a_90aa_11ed_a1eb_0242ac120002);
pub const SETTING_SERVICE: Uuid = Uuid::from_u128(0xef84369a_90a9_11ed_a1eb_0242ac120002);
pub const DFU_SERVICE: Uuid = short_uuid(0xfe59);

pub const SERVICES: &[(Uuid, &str)] = &[
    (GENERIC_ACCESS_SERVICE, "Generic Access"),
    (DEVICE_INFORMATION_SERVICE, "Device Information"),
    (BATTERY_SERVICE, "Battery Service"),
    (TRACKER_SERVICE, "Tracker Service"),
    (SETTING_SERVICE, "Setting Service"),
    (DFU_SERVICE, "DFU Service"),
];

pub const CHARACTERISTICS: &[(Uuid, &str)] = &[
    (
        Uuid::from_u128(0x00dbf1c6_90aa_11ed_a1eb_0242ac120002),
        names::SENSOR,
    ),
    (
        Uuid::from_u128(0x00dbf450_90aa_11ed_a1eb_0242ac120002),
        names::MAIN_BUTTON,
    ),
    (
        Uuid::from_u128(0x00dbf586_90aa_11ed_a1eb_0242ac120002),
        names::SECONDARY_BUTTON,
    ),
    (short_uuid(0x2a19), names::BATTERY_LEVEL),
    (
        Uuid::from_u128(0x00dbf07c_90aa_11ed_a1eb_0242ac120002),
        names::BATTERY_VOLTAGE,
    ),
    (
        Uuid::from_u128(0x00dbf0b8_90aa_11ed_a1eb_0242ac120002),
        names::CHARGE_STATUS,
    ),
    (
        Uuid::from_u128(0xef844202_90a9_11ed_a1eb_0242ac120002),
        names::FPS_SETTING,
    ),
    (
        Uuid::from_u128(0xef8445c2_90a9_11ed_a1eb_0242ac120002),
        names::SENSOR_MODE_SETTING,
    ),
    (
        Uuid::from_u128(0xef84476a_90a9_11ed_a1eb_0242ac120002),
        names::WIRELESS_MODE_SETTING,
    ),
    (
        Uuid::from_u128(0xef8449a0_90a9_11ed_a1eb_0242ac120002),
        names::AUTO_CALIBRATION_SETTING,
    ),
    (short_uuid(0x2a25), names::SERIAL_NUMBER),
    (short_uuid(0x2a29), names::MANUFACTURER),
    (short_uuid(0x2a27), names::HARDWARE_REVISION),
    (short_uuid(0x2a26), names::FIRMWARE_REVISION),
    (short_uuid(0x2a28), names::SOFTWARE_REVISION),
    (short_uuid(0x2a24), names::MODEL_NUMBER),
];

pub fn service_name(uuid: Uuid) -> Option<&'static str> {
    SERVICES
        .iter()
        .find(|(id, _)| *id == uuid)
        .map(|(_, name)| *name)
}

pub fn characteristic_name(uuid: Uuid) -> Option<&'static str> {
    CHARACTERISTICS
        .iter()
        .find(|(id, _)| *id == uuid)
        .map(|(_, name)| *name)
}

pub fn characteristic_uuid(name: &str) -> Option<Uuid> {
    CHARACTERISTICS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(id, _)| *id)
}

/// Frame kind a characteristic's notifications decode as.
pub fn characteristic_kind(name: &str) -> FrameKind {
    match name {
        names::SENSOR => FrameKind::Orientation,
        names::MAIN_BUTTON | names::SECONDARY_BUTTON => FrameKind::Button,
        names::BATTERY_LEVEL | names::BATTERY_VOLTAGE | names::CHARGE_STATUS => {
            FrameKind::Battery
        }
        names::FPS_SETTING
        | names::SENSOR_MODE_SETTING
        | names::AUTO_CALIBRATION_SETTING
        | names::WIRELESS_MODE_SETTING => FrameKind::Settings,
        names::SERIAL_NUMBER
        | names::MANUFACTURER
        | names::HARDWARE_REVISION
        | names::FIRMWARE_REVISION
        | names::SOFTWARE_REVISION
        | names::MODEL_NUMBER => FrameKind::Info,
        _ => FrameKind::Unknown,
    }
}

/// Whether a scanned device belongs to the tracker family.
pub fn is_tracker_name(local_name: &str, prefix: &str) -> bool {
    local_name.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            BATTERY_SERVICE.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(service_name(BATTERY_SERVICE), Some("Battery Service"));
    }

    #[test]
    fn test_characteristic_lookup_both_ways() {
        let uuid = characteristic_uuid(names::SENSOR).unwrap();
        assert_eq!(characteristic_name(uuid), Some(names::SENSOR));
        assert_eq!(characteristic_kind(names::SENSOR), FrameKind::Orientation);
        assert_eq!(characteristic_kind(names::MODEL_NUMBER), FrameKind::Info);
    }

    #[test]
    fn test_tracker_name_filter() {
        assert!(is_tracker_name("HaritoraX-W 1A2B", DEVICE_NAME_PREFIX));
        assert!(!is_tracker_name("Keyboard", DEVICE_NAME_PREFIX));
    }
}

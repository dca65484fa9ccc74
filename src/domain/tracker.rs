//! Tracker settings values and per-identity live state.

use crate::domain::models::{BatteryReport, ButtonState, DeviceInfo, ImuSample};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorMode {
    /// Accelerometer, gyroscope and magnetometer.
    Mode1,
    /// Accelerometer and gyroscope only.
    Mode2,
}

impl SensorMode {
    pub fn number(self) -> u8 {
        match self {
            Self::Mode1 => 1,
            Self::Mode2 => 2,
        }
    }

    pub fn from_number(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Mode1),
            2 => Some(Self::Mode2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fps {
    Fps50,
    Fps100,
}

impl Fps {
    pub fn rate(self) -> u8 {
        match self {
            Self::Fps50 => 50,
            Self::Fps100 => 100,
        }
    }

    pub fn from_rate(rate: u8) -> Option<Self> {
        match rate {
            50 => Some(Self::Fps50),
            100 => Some(Self::Fps100),
            _ => None,
        }
    }
}

/// Which sensors the firmware may use for drift correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AutoCorrection {
    pub accel: bool,
    pub gyro: bool,
    pub mag: bool,
}

impl AutoCorrection {
    pub const ACCEL: u8 = 0x1;
    pub const GYRO: u8 = 0x2;
    pub const MAG: u8 = 0x4;

    pub fn bitmask(self) -> u8 {
        let mut mask = 0;
        if self.accel {
            mask |= Self::ACCEL;
        }
        if self.gyro {
            mask |= Self::GYRO;
        }
        if self.mag {
            mask |= Self::MAG;
        }
        mask
    }

    pub fn from_bitmask(mask: u8) -> Self {
        Self {
            accel: mask & Self::ACCEL != 0,
            gyro: mask & Self::GYRO != 0,
            mag: mask & Self::MAG != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackerSettings {
    pub sensor_mode: SensorMode,
    pub fps: Fps,
    pub auto_correction: AutoCorrection,
    pub ankle_motion_detection: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            sensor_mode: SensorMode::Mode2,
            fps: Fps::Fps50,
            auto_correction: AutoCorrection {
                accel: true,
                gyro: false,
                mag: false,
            },
            ankle_motion_detection: false,
        }
    }
}

/// Live state of one tracker, created on its first frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrackerRuntimeState {
    pub connected: bool,
    pub imu: Option<ImuSample>,
    pub battery: BatteryReport,
    pub buttons: ButtonState,
    /// Last settings seen from the tracker or last applied to it.
    pub settings: Option<TrackerSettings>,
    pub info: DeviceInfo,
    pub(crate) raw_settings: Option<String>,
    pub(crate) raw_buttons: Option<String>,
}

impl TrackerRuntimeState {
    /// Drop live readings after a disconnect. Last applied settings survive
    /// so the partner tracker's settings frame stays correct.
    pub fn reset(&mut self) {
        let settings = self.settings;
        *self = Self {
            settings,
            ..Self::default()
        };
    }
}

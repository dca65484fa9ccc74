use crate::domain::error::InterpreterError;
use crate::domain::tracker::TrackerSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

/// Anatomical tracker slot, plus the dongle pseudo-tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackerIdentity {
    Dongle,
    Chest,
    LeftKnee,
    LeftAnkle,
    RightKnee,
    RightAnkle,
    Hip,
    RightElbow,
    LeftElbow,
}

/// Order in which adjacent trackers share a settings control channel.
///
/// Odd positions pair with the entry before them, even positions with the
/// entry after them.
const SETTINGS_ORDER: [TrackerIdentity; 8] = [
    TrackerIdentity::RightAnkle,
    TrackerIdentity::RightKnee,
    TrackerIdentity::Chest,
    TrackerIdentity::Hip,
    TrackerIdentity::LeftAnkle,
    TrackerIdentity::LeftKnee,
    TrackerIdentity::RightElbow,
    TrackerIdentity::LeftElbow,
];

impl TrackerIdentity {
    pub const ALL: [TrackerIdentity; 9] = [
        Self::Dongle,
        Self::Chest,
        Self::LeftKnee,
        Self::LeftAnkle,
        Self::RightKnee,
        Self::RightAnkle,
        Self::Hip,
        Self::RightElbow,
        Self::LeftElbow,
    ];

    /// The lower-body set a full-body kit ships with.
    pub const LOWER_BODY: [TrackerIdentity; 6] = [
        Self::Hip,
        Self::Chest,
        Self::LeftKnee,
        Self::LeftAnkle,
        Self::RightKnee,
        Self::RightAnkle,
    ];

    /// Numeric id carried in acknowledgement frames.
    pub fn protocol_id(self) -> u8 {
        match self {
            Self::Dongle => 0,
            Self::Chest => 1,
            Self::LeftKnee => 2,
            Self::LeftAnkle => 3,
            Self::RightKnee => 4,
            Self::RightAnkle => 5,
            Self::Hip => 6,
            Self::RightElbow => 7,
            Self::LeftElbow => 8,
        }
    }

    pub fn from_protocol_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|identity| identity.protocol_id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Dongle => "DONGLE",
            Self::Chest => "chest",
            Self::LeftKnee => "leftKnee",
            Self::LeftAnkle => "leftAnkle",
            Self::RightKnee => "rightKnee",
            Self::RightAnkle => "rightAnkle",
            Self::Hip => "hip",
            Self::RightElbow => "rightElbow",
            Self::LeftElbow => "leftElbow",
        }
    }

    pub fn is_ankle(self) -> bool {
        matches!(self, Self::LeftAnkle | Self::RightAnkle)
    }

    /// Tracker whose settings travel in the same control frame.
    pub fn settings_partner(self) -> Option<Self> {
        let index = SETTINGS_ORDER.iter().position(|&t| t == self)?;
        let partner = if index % 2 == 1 { index - 1 } else { index + 1 };
        SETTINGS_ORDER.get(partner).copied()
    }

    /// Knee tracker packed into the same orientation frame as this ankle.
    pub fn leg_partner(self) -> Option<Self> {
        match self {
            Self::LeftAnkle => Some(Self::LeftKnee),
            Self::RightAnkle => Some(Self::RightKnee),
            _ => None,
        }
    }
}

impl fmt::Display for TrackerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrackerIdentity {
    type Err = InterpreterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|identity| identity.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InterpreterError::InvalidIdentity(s.to_string()))
    }
}

/// Logical slot on a physical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubPort {
    Port0,
    Port1,
    /// Frames with no port digit come from the base station itself.
    Dongle,
}

impl SubPort {
    pub fn from_digit(digit: char) -> Option<Self> {
        match digit {
            '0' => Some(Self::Port0),
            '1' => Some(Self::Port1),
            _ => None,
        }
    }

    /// Digit used in identifiers; empty for the dongle.
    pub fn digit(self) -> &'static str {
        match self {
            Self::Port0 => "0",
            Self::Port1 => "1",
            Self::Dongle => "",
        }
    }

    pub fn is_tracker_port(self) -> bool {
        !matches!(self, Self::Dongle)
    }
}

impl fmt::Display for SubPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dongle => f.write_str("DONGLE"),
            port => f.write_str(port.digit()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    DongleSerial,
    BleGatt,
    BtSpp,
}

impl TransportKind {
    /// Whether the transport speaks the `identifier:payload` line protocol.
    pub fn is_line_protocol(self) -> bool {
        !matches!(self, Self::BleGatt)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DongleSerial => "dongle-serial",
            Self::BleGatt => "ble-gatt",
            Self::BtSpp => "bt-spp",
        };
        f.write_str(name)
    }
}

/// Serial path or BLE address naming one physical endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Gravity {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One decoded orientation packet.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuSample {
    pub rotation: Rotation,
    pub gravity: Gravity,
    pub ankle: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatteryReport {
    pub percent: Option<u8>,
    /// Millivolts.
    pub voltage: Option<u32>,
    pub charge_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ButtonState {
    pub main: u8,
    pub sub: u8,
    pub powered_on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub version: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub manufacturer: Option<String>,
    pub hardware_revision: Option<String>,
    pub software_revision: Option<String>,
}

/// Everything the interpreter reports to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Connected {
        channel: ChannelId,
        kind: TransportKind,
    },
    Disconnected {
        channel: ChannelId,
    },
    TrackerConnected(TrackerIdentity),
    TrackerDisconnected(TrackerIdentity),
    Paired {
        identity: TrackerIdentity,
        channel: ChannelId,
        subport: SubPort,
    },
    Unpaired {
        identity: TrackerIdentity,
        channel: ChannelId,
        subport: SubPort,
    },
    Imu {
        identity: TrackerIdentity,
        sample: ImuSample,
    },
    Battery {
        identity: TrackerIdentity,
        report: BatteryReport,
    },
    Button {
        identity: TrackerIdentity,
        state: ButtonState,
    },
    Settings {
        identity: TrackerIdentity,
        settings: TrackerSettings,
    },
    Info {
        identity: TrackerIdentity,
        info: DeviceInfo,
    },
    /// Raw telemetry the interpreter does not decode further.
    Tracker {
        identity: TrackerIdentity,
        payload: String,
    },
    Log(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn is_exceptional(&self) -> bool {
        self.severity == MessageSeverity::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Cloneable sending half of the event stream.
///
/// A closed receiver is not an error: events are simply dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<TrackerEvent>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<TrackerEvent>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: TrackerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.emit(TrackerEvent::Log(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    /// Trace and forward an error as an exceptional diagnostic.
    pub fn error(&self, error: &InterpreterError) {
        if error.is_recoverable() {
            tracing::warn!("{}", error);
        } else {
            tracing::error!("{}", error);
        }
        self.log(error.to_string(), MessageSeverity::Error);
    }
}

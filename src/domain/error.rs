use crate::domain::models::{ChannelId, SubPort, TrackerIdentity, TransportKind};
use thiserror::Error;

/// Errors raised by the session and protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpreterError {
    /// Port busy or missing, adapter off.
    #[error("channel {channel} unavailable: {reason}")]
    ChannelUnavailable { channel: ChannelId, reason: String },

    #[error("write to {channel} failed: {reason}")]
    WriteFailed { channel: ChannelId, reason: String },

    #[error("channel {0} disconnected")]
    Disconnected(ChannelId),

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("unrecognized characteristic {0}")]
    UnrecognizedCharacteristic(String),

    #[error("pairing already in progress on {0}")]
    PairingInProgress(ChannelId),

    #[error("pairing on {channel} port {subport} timed out")]
    PairingTimeout { channel: ChannelId, subport: SubPort },

    #[error("invalid radio channel {0} (expected 0-10)")]
    InvalidChannelNumber(u8),

    #[error("unknown tracker `{0}`")]
    InvalidIdentity(String),

    #[error("tracker {0} is not assigned to a channel")]
    NotAssigned(TrackerIdentity),

    #[error("interpreter is not running")]
    NotStarted,

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("{operation} is not supported on {kind} channels")]
    Unsupported {
        kind: TransportKind,
        operation: &'static str,
    },
}

impl InterpreterError {
    /// Transport and decode failures; everything else is a caller mistake.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChannelUnavailable { .. }
                | Self::WriteFailed { .. }
                | Self::Disconnected(_)
                | Self::MalformedPacket(_)
                | Self::UnknownIdentifier(_)
                | Self::UnrecognizedCharacteristic(_)
                | Self::PairingTimeout { .. }
        )
    }
}

pub type InterpreterResult<T> = Result<T, InterpreterError>;

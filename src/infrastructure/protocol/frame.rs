//! Frame Parser
//!
//! Serial and SPP transports deliver `identifier:payload` lines; BLE delivers
//! one notification per characteristic. Both end up as a [`Frame`].

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::SubPort;
use crate::infrastructure::protocol::gatt;
use tracing::trace;
use uuid::Uuid;

/// Bytes buffered without a terminator before the buffer is discarded
const MAX_LINE_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// `x`: rotation and gravity
    Orientation,
    /// `a`: miscellaneous telemetry or search ping
    Telemetry,
    /// `r`: buttons and acknowledgements
    Button,
    /// `v`
    Battery,
    /// `o`
    Settings,
    /// `i`
    Info,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    identifier: String,
    payload: Payload,
}

impl Frame {
    /// Line-protocol frame; the identifier is lower-cased.
    pub fn line(identifier: &str, payload: impl Into<String>) -> Self {
        Self {
            identifier: identifier.trim().to_ascii_lowercase(),
            payload: Payload::Text(payload.into()),
        }
    }

    /// GATT frame named after its characteristic.
    pub fn gatt(characteristic: &str, value: Vec<u8>) -> Self {
        Self {
            identifier: characteristic.to_string(),
            payload: Payload::Binary(value),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    pub fn is_gatt(&self) -> bool {
        matches!(self.payload, Payload::Binary(_))
    }

    pub fn kind(&self) -> FrameKind {
        if self.is_gatt() {
            return gatt::characteristic_kind(&self.identifier);
        }
        match self.identifier.chars().next() {
            Some('x') => FrameKind::Orientation,
            Some('a') => FrameKind::Telemetry,
            Some('r') => FrameKind::Button,
            Some('v') => FrameKind::Battery,
            Some('o') => FrameKind::Settings,
            Some('i') => FrameKind::Info,
            _ => FrameKind::Unknown,
        }
    }

    /// Sub-port encoded in the identifier. GATT frames always use port 0,
    /// line frames without a digit belong to the dongle, and digits other
    /// than 0/1 yield `None`.
    pub fn subport(&self) -> Option<SubPort> {
        if self.is_gatt() {
            return Some(SubPort::Port0);
        }
        match self.identifier.chars().find(|c| c.is_ascii_digit()) {
            Some(digit) => SubPort::from_digit(digit),
            None => Some(SubPort::Dongle),
        }
    }

    /// Payload rendered as text, hex for binary payloads.
    pub fn payload_string(&self) -> String {
        match &self.payload {
            Payload::Text(text) => text.clone(),
            Payload::Binary(bytes) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        }
    }
}

/// Split one line on the first `:`.
pub fn parse_line(line: &str) -> InterpreterResult<Frame> {
    let (identifier, payload) = line
        .split_once(':')
        .ok_or_else(|| InterpreterError::MalformedPacket(format!("no separator in `{}`", line)))?;
    if identifier.trim().is_empty() {
        return Err(InterpreterError::UnknownIdentifier(line.to_string()));
    }
    Ok(Frame::line(identifier, payload.trim_end()))
}

/// Map a BLE notification onto a frame through the characteristic table.
pub fn gatt_frame(characteristic: Uuid, value: Vec<u8>) -> InterpreterResult<Frame> {
    let name = gatt::characteristic_name(characteristic)
        .ok_or_else(|| InterpreterError::UnrecognizedCharacteristic(characteristic.to_string()))?;
    Ok(Frame::gatt(name, value))
}

/// Incremental line splitter for one channel's byte stream.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(256),
        }
    }

    /// Feed a chunk and collect every complete line it finishes.
    pub fn push(&mut self, data: &[u8]) -> Vec<InterpreterResult<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        while let Some(end) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            trace!("line: {}", text);
            frames.push(parse_line(text));
        }

        if self.buf.len() > MAX_LINE_LEN {
            let dropped = self.buf.len();
            self.buf.clear();
            frames.push(Err(InterpreterError::MalformedPacket(format!(
                "{} bytes without line terminator discarded",
                dropped
            ))));
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_splits_on_first_colon() {
        let frame = parse_line("V0:{\"a\":1}").unwrap();
        assert_eq!(frame.identifier(), "v0");
        assert_eq!(frame.text(), Some("{\"a\":1}"));
        assert_eq!(frame.kind(), FrameKind::Battery);
        assert_eq!(frame.subport(), Some(SubPort::Port0));
    }

    #[test]
    fn test_dongle_frames_have_no_port_digit() {
        let frame = parse_line("i:{}").unwrap();
        assert_eq!(frame.subport(), Some(SubPort::Dongle));
        assert_eq!(parse_line("x7:AAAA").unwrap().subport(), None);
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        assert!(matches!(
            parse_line("garbage"),
            Err(InterpreterError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_framer_handles_split_chunks() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"r0:1100").is_empty());
        let frames = framer.push(b"60800\r\nr1:11004\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().text(), Some("110060800"));
        assert_eq!(frames[1].as_ref().unwrap().identifier(), "r1");
    }

    #[test]
    fn test_framer_reports_bad_line_and_continues() {
        let mut framer = LineFramer::new();
        let frames = framer.push(b"noise\r\nv1:{}\r\n");
        assert!(frames[0].is_err());
        assert!(frames[1].is_ok());
    }

    #[test]
    fn test_framer_discards_runaway_buffer() {
        let mut framer = LineFramer::new();
        let frames = framer.push(&vec![b'a'; MAX_LINE_LEN + 1]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_err());
        assert!(framer.push(b"i:{}\n")[0].is_ok());
    }

    #[test]
    fn test_gatt_frame_unknown_uuid() {
        let result = gatt_frame(Uuid::nil(), vec![1]);
        assert!(matches!(
            result,
            Err(InterpreterError::UnrecognizedCharacteristic(_))
        ));
    }
}

//! Orientation packet decoding
//!
//! # Packet Structure (14 or 16 bytes, little-endian i16 fields)
//!
//! ```text
//! [0-1]   : Rotation X   (raw / 180 * 0.01)
//! [2-3]   : Rotation Y   (raw / 180 * 0.01)
//! [4-5]   : Rotation Z   (-raw / 180 * 0.01)
//! [6-7]   : Rotation W   (-raw / 180 * 0.01)
//! [8-9]   : Gravity X    (raw / 256)
//! [10-11] : Gravity Y    (raw / 256)
//! [12-13] : Gravity Z    (raw / 256)
//! [14-15] : Ankle        (raw, optional)
//! ```
//!
//! Newer ankle trackers pack the paired knee into the same frame once the
//! payload reaches 40 bytes: the ankle in `[0..14)` and the knee in
//! `[16..30)`, or `[18..32)` for 44-byte payloads. The two extra bytes of
//! the 44-byte layout are not interpreted.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{Gravity, ImuSample, Rotation, TrackerIdentity};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use tracing::{trace, warn};

pub const IMU_PACKET_LEN: usize = 14;
pub const IMU_PACKET_WITH_ANKLE_LEN: usize = 16;
pub const LEGS_PACKED_LEN: usize = 40;
pub const LEGS_PACKED_WIDE_LEN: usize = 44;

/// Base64 engine that accepts padded and unpadded payloads
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Scaling factors applied to raw fields
pub mod imu_scale {
    pub const ROTATION_DIVISOR: f64 = 180.0;
    pub const ROTATION_FACTOR: f64 = 0.01;
    pub const GRAVITY_DIVISOR: f64 = 256.0;
}

/// Result of decoding one orientation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedOrientation {
    Single(ImuSample),
    /// Ankle frame that also carries its knee.
    LegsPacked { ankle: ImuSample, knee: ImuSample },
}

impl DecodedOrientation {
    /// Flatten into (identity, sample) pairs.
    pub fn into_samples(self, identity: TrackerIdentity) -> Vec<(TrackerIdentity, ImuSample)> {
        match self {
            Self::Single(sample) => vec![(identity, sample)],
            Self::LegsPacked { ankle, knee } => {
                let mut samples = vec![(identity, ankle)];
                if let Some(partner) = identity.leg_partner() {
                    samples.push((partner, knee));
                }
                samples
            }
        }
    }
}

/// Decode the text payload of an `x` frame.
pub fn decode_base64(payload: &str) -> InterpreterResult<Vec<u8>> {
    LENIENT_BASE64
        .decode(payload.trim())
        .map_err(|e| InterpreterError::MalformedPacket(format!("invalid base64 payload: {}", e)))
}

fn read_i16(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Decode one 14/16-byte packet.
///
/// Length decides whether the ankle field is present; a single trailing
/// byte is ignored with a warning.
pub fn decode_imu(bytes: &[u8]) -> InterpreterResult<ImuSample> {
    if bytes.len() < IMU_PACKET_LEN {
        return Err(InterpreterError::MalformedPacket(format!(
            "orientation packet too short: {} bytes (expected {})",
            bytes.len(),
            IMU_PACKET_LEN
        )));
    }

    let rotation = Rotation {
        x: read_i16(bytes, 0) as f64 / imu_scale::ROTATION_DIVISOR * imu_scale::ROTATION_FACTOR,
        y: read_i16(bytes, 2) as f64 / imu_scale::ROTATION_DIVISOR * imu_scale::ROTATION_FACTOR,
        z: -(read_i16(bytes, 4) as f64) / imu_scale::ROTATION_DIVISOR
            * imu_scale::ROTATION_FACTOR,
        w: -(read_i16(bytes, 6) as f64) / imu_scale::ROTATION_DIVISOR
            * imu_scale::ROTATION_FACTOR,
    };

    let gravity = Gravity {
        x: read_i16(bytes, 8) as f64 / imu_scale::GRAVITY_DIVISOR,
        y: read_i16(bytes, 10) as f64 / imu_scale::GRAVITY_DIVISOR,
        z: read_i16(bytes, 12) as f64 / imu_scale::GRAVITY_DIVISOR,
    };

    let ankle = if bytes.len() >= IMU_PACKET_WITH_ANKLE_LEN {
        Some(read_i16(bytes, 14))
    } else {
        if bytes.len() > IMU_PACKET_LEN {
            warn!(
                "orientation packet has {} bytes; trailing byte ignored",
                bytes.len()
            );
        }
        None
    };

    Ok(ImuSample {
        rotation,
        gravity,
        ankle,
    })
}

/// Decode an orientation payload for `identity`, splitting packed leg frames.
pub fn decode_orientation(
    identity: TrackerIdentity,
    bytes: &[u8],
) -> InterpreterResult<DecodedOrientation> {
    trace!("orientation {} bytes for {}", bytes.len(), identity);

    if identity.is_ankle() && bytes.len() >= LEGS_PACKED_LEN {
        let knee_offset = if bytes.len() >= LEGS_PACKED_WIDE_LEN {
            18
        } else {
            16
        };
        let ankle = decode_imu(&bytes[..IMU_PACKET_LEN])?;
        let knee = decode_imu(&bytes[knee_offset..knee_offset + IMU_PACKET_LEN])?;
        return Ok(DecodedOrientation::LegsPacked { ankle, knee });
    }

    decode_imu(bytes).map(DecodedOrientation::Single)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(fields: &[i16]) -> Vec<u8> {
        fields.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    #[test]
    fn test_decode_scaling_is_exact() {
        let bytes = packet(&[900, -1800, 360, 18000, 256, -512, 128]);
        let sample = decode_imu(&bytes).unwrap();

        assert_eq!(sample.rotation.x, 900.0 / 180.0 * 0.01);
        assert_eq!(sample.rotation.y, -1800.0 / 180.0 * 0.01);
        assert_eq!(sample.rotation.z, -360.0 / 180.0 * 0.01);
        assert_eq!(sample.rotation.w, -18000.0 / 180.0 * 0.01);
        assert_eq!(sample.gravity.x, 1.0);
        assert_eq!(sample.gravity.y, -2.0);
        assert_eq!(sample.gravity.z, 0.5);
        assert_eq!(sample.ankle, None);
    }

    #[test]
    fn test_decode_reads_ankle_when_present() {
        let bytes = packet(&[0, 0, 0, 0, 0, 0, 0, -42]);
        assert_eq!(decode_imu(&bytes).unwrap().ankle, Some(-42));
    }

    #[test]
    fn test_short_packet_is_malformed() {
        assert!(matches!(
            decode_imu(&[0u8; 13]),
            Err(InterpreterError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_odd_length_ignores_trailing_byte() {
        let mut bytes = packet(&[1, 2, 3, 4, 5, 6, 7]);
        bytes.push(0xff);
        assert_eq!(decode_imu(&bytes).unwrap().ankle, None);
    }

    #[test]
    fn test_base64_with_and_without_padding() {
        let bytes = packet(&[1, 2, 3, 4, 5, 6, 7]);
        let padded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        assert!(padded.ends_with('='));
        assert_eq!(decode_base64(&padded).unwrap(), bytes);
        assert_eq!(decode_base64(padded.trim_end_matches('=')).unwrap(), bytes);
        assert!(decode_base64("not base64!").is_err());
    }

    #[test]
    fn test_legs_packed_frames_split() {
        let ankle = packet(&[180, 0, 0, 0, 0, 0, 256]);
        let knee = packet(&[360, 0, 0, 0, 0, 0, 512]);

        let mut narrow = ankle.clone();
        narrow.extend_from_slice(&[0, 0]);
        narrow.extend_from_slice(&knee);
        narrow.resize(LEGS_PACKED_LEN, 0);

        let decoded = decode_orientation(TrackerIdentity::LeftAnkle, &narrow).unwrap();
        let samples = decoded.into_samples(TrackerIdentity::LeftAnkle);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].0, TrackerIdentity::LeftAnkle);
        assert_eq!(samples[0].1.gravity.z, 1.0);
        assert_eq!(samples[1].0, TrackerIdentity::LeftKnee);
        assert_eq!(samples[1].1.gravity.z, 2.0);

        let mut wide = ankle;
        wide.extend_from_slice(&[0, 0, 0, 0]);
        wide.extend_from_slice(&knee);
        wide.resize(LEGS_PACKED_WIDE_LEN, 0);
        match decode_orientation(TrackerIdentity::RightAnkle, &wide).unwrap() {
            DecodedOrientation::LegsPacked { knee, .. } => assert_eq!(knee.gravity.z, 2.0),
            other => panic!("expected packed frame, got {:?}", other),
        }
    }

    #[test]
    fn test_long_payload_on_non_ankle_is_single() {
        let bytes = vec![0u8; LEGS_PACKED_LEN];
        assert!(matches!(
            decode_orientation(TrackerIdentity::Hip, &bytes).unwrap(),
            DecodedOrientation::Single(_)
        ));
    }
}

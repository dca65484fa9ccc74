//! Wire Protocol Module
//!
//! Everything that touches bytes on the wire:
//! - `frame`: line splitting and BLE notification mapping
//! - `imu`: orientation packet decoding
//! - `codec`: settings, battery, button and device-info payloads
//! - `commands`: outbound command builders
//! - `gatt`: BLE service and characteristic tables

pub mod codec;
pub mod commands;
pub mod frame;
pub mod gatt;
pub mod imu;

pub use commands::{Outbound, BAUD_RATE};
pub use frame::{Frame, FrameKind, LineFramer, Payload};

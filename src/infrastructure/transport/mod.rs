//! Transport Module
//!
//! Uniform channel handle over every physical endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ConnectionSupervisor             │
//! └──────────────────────┬───────────────────────┘
//!                        │  Arc<dyn Channel>
//!        ┌───────────────┼───────────────┐
//!        ▼               ▼               ▼
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │SerialChannel│ │ BleChannel  │ │MemoryChannel│
//! │ dongle, SPP │ │ GATT (ble)  │ │   tests     │
//! └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`serial`] - USB dongle and Bluetooth SPP ports
//! - [`ble`] - BLE GATT trackers
//! - [`memory`] - in-process channel driven by a handle
//! - [`scanner`] - serial port listing and BLE discovery

use crate::domain::error::InterpreterResult;
use crate::domain::models::{ChannelId, TransportKind};
use crate::infrastructure::protocol::Outbound;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "ble")]
pub mod ble;
pub mod memory;
pub mod scanner;
#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "ble")]
pub use ble::BleChannel;
pub use memory::{MemoryChannel, MemoryHandle};
#[cfg(feature = "serial")]
pub use serial::SerialChannel;

/// Inbound traffic of one open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInput {
    /// Raw chunk from a byte stream.
    Bytes(Vec<u8>),
    /// GATT notification or read result.
    Notification {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The endpoint went away.
    Closed { reason: String },
}

/// One physical endpoint.
///
/// `open` hands back a fresh inbound stream every time; the stream ends with
/// [`ChannelInput::Closed`] or by closing when the transport drops.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> &ChannelId;

    fn kind(&self) -> TransportKind;

    async fn open(&self) -> InterpreterResult<mpsc::UnboundedReceiver<ChannelInput>>;

    async fn write(&self, command: &Outbound) -> InterpreterResult<()>;

    async fn close(&self) -> InterpreterResult<()>;
}

//! Host-side interpreter for full-body-tracking wearables.
//!
//! Trackers reach the host through a USB dongle (two trackers per serial
//! port), directly over BLE GATT, or over Bluetooth SPP. The interpreter
//! keeps those links alive, works out which tracker sits behind which port,
//! decodes their traffic and reports it as [`TrackerEvent`]s.
//!
//! ```no_run
//! use fbt_interpreter::{Settings, TrackerInterpreter};
//!
//! # async fn run() {
//! let (interpreter, mut events) = TrackerInterpreter::new(Settings::default());
//! # #[cfg(feature = "serial")]
//! interpreter.start_serial();
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

pub mod domain;
pub mod infrastructure;

pub use domain::error::{InterpreterError, InterpreterResult};
pub use domain::models::{
    ChannelId, ImuSample, MessageSeverity, StatusMessage, SubPort, TrackerEvent, TrackerIdentity,
    TransportKind,
};
pub use domain::settings::{Settings, SettingsService};
pub use domain::tracker::{TrackerRuntimeState, TrackerSettings};
pub use infrastructure::service::TrackerInterpreter;

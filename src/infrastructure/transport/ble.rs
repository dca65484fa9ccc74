//! BLE Channel
//!
//! One tracker per peripheral. Notifying characteristics are subscribed on
//! open; characteristic reads requested by the host are pushed into the same
//! inbound stream so the session sees reads and notifications alike.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{ChannelId, TransportKind};
use crate::infrastructure::protocol::Outbound;
use crate::infrastructure::transport::{Channel, ChannelInput};
use async_trait::async_trait;
use btleplug::api::{
    CentralEvent, Central, CharPropFlags, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Interval between peripheral list polls while looking for the device
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

#[derive(Default)]
struct Link {
    peripheral: Option<Peripheral>,
    inbound: Option<mpsc::UnboundedSender<ChannelInput>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BleChannel {
    id: ChannelId,
    adapter: Adapter,
    discovery_timeout: Duration,
    link: Mutex<Link>,
}

impl BleChannel {
    /// Channel for the peripheral with Bluetooth address `address`.
    pub fn new(adapter: Adapter, address: impl Into<String>, discovery_timeout: Duration) -> Self {
        Self {
            id: ChannelId::new(address),
            adapter,
            discovery_timeout,
            link: Mutex::new(Link::default()),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unavailable(&self, reason: impl ToString) -> InterpreterError {
        InterpreterError::ChannelUnavailable {
            channel: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    fn write_failed(&self, reason: impl ToString) -> InterpreterError {
        InterpreterError::WriteFailed {
            channel: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    async fn find_known(&self) -> Option<Peripheral> {
        let peripherals = self.adapter.peripherals().await.ok()?;
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(self.id.as_str()) {
                    return Some(peripheral);
                }
            }
        }
        None
    }

    /// Look for the peripheral, scanning until the discovery timeout.
    async fn discover(&self) -> InterpreterResult<Peripheral> {
        if let Some(peripheral) = self.find_known().await {
            return Ok(peripheral);
        }

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| self.unavailable(e))?;
        let deadline = Instant::now() + self.discovery_timeout;
        let found = loop {
            if let Some(peripheral) = self.find_known().await {
                break Some(peripheral);
            }
            if Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
        };
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }

        found.ok_or_else(|| self.unavailable("peripheral not found"))
    }

    fn characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> InterpreterResult<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| InterpreterError::UnrecognizedCharacteristic(uuid.to_string()))
    }

    fn connected_peripheral(&self) -> InterpreterResult<(Peripheral, mpsc::UnboundedSender<ChannelInput>)> {
        let link = self.link();
        match (&link.peripheral, &link.inbound) {
            (Some(peripheral), Some(inbound)) => Ok((peripheral.clone(), inbound.clone())),
            _ => Err(self.write_failed("peripheral not connected")),
        }
    }

    fn stop_tasks(&self) -> Option<Peripheral> {
        let mut link = self.link();
        for task in link.tasks.drain(..) {
            task.abort();
        }
        link.inbound = None;
        link.peripheral.take()
    }
}

#[async_trait]
impl Channel for BleChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::BleGatt
    }

    async fn open(&self) -> InterpreterResult<mpsc::UnboundedReceiver<ChannelInput>> {
        self.stop_tasks();

        // Step 1: Find and connect
        let peripheral = self.discover().await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(|e| self.unavailable(e))?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(|e| self.unavailable(e))?;
        info!("Connected to BLE tracker {}", self.id);

        // Step 2: Subscribe to everything that notifies
        for characteristic in peripheral.characteristics() {
            if characteristic.properties.contains(CharPropFlags::NOTIFY) {
                if let Err(e) = peripheral.subscribe(&characteristic).await {
                    warn!("Could not subscribe to {}: {}", characteristic.uuid, e);
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| self.unavailable(e))?;
        let mut adapter_events = self.adapter.events().await.map_err(|e| self.unavailable(e))?;

        // Step 3: Forward notifications until the stream ends
        let notify_tx = tx.clone();
        let notify_id = self.id.clone();
        let notifier = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let input = ChannelInput::Notification {
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if notify_tx.send(input).is_err() {
                    return;
                }
            }
            debug!("Notification stream of {} ended", notify_id);
            let _ = notify_tx.send(ChannelInput::Closed {
                reason: "notification stream ended".into(),
            });
        });

        // Step 4: Watch for the link dropping
        let watch_tx = tx.clone();
        let peripheral_id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        let _ = watch_tx.send(ChannelInput::Closed {
                            reason: "peripheral disconnected".into(),
                        });
                        return;
                    }
                }
            }
        });

        let mut link = self.link();
        link.peripheral = Some(peripheral);
        link.inbound = Some(tx);
        link.tasks = vec![notifier, watcher];
        Ok(rx)
    }

    async fn write(&self, command: &Outbound) -> InterpreterResult<()> {
        let (peripheral, inbound) = self.connected_peripheral()?;
        match command {
            Outbound::ReadCharacteristic { characteristic } => {
                let target = self.characteristic(&peripheral, *characteristic)?;
                let value = peripheral
                    .read(&target)
                    .await
                    .map_err(|e| self.write_failed(e))?;
                let _ = inbound.send(ChannelInput::Notification {
                    characteristic: target.uuid,
                    value,
                });
                Ok(())
            }
            Outbound::WriteCharacteristic {
                characteristic,
                value,
            } => {
                let target = self.characteristic(&peripheral, *characteristic)?;
                peripheral
                    .write(&target, value, WriteType::WithResponse)
                    .await
                    .map_err(|e| self.write_failed(e))
            }
            Outbound::Lines(_) => Err(InterpreterError::Unsupported {
                kind: TransportKind::BleGatt,
                operation: "line commands",
            }),
        }
    }

    async fn close(&self) -> InterpreterResult<()> {
        if let Some(peripheral) = self.stop_tasks() {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnecting {} failed: {}", self.id, e);
            }
            info!("Disconnected BLE tracker {}", self.id);
        }
        Ok(())
    }
}

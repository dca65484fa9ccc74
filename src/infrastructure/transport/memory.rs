//! In-process channel
//!
//! Behaves like a real endpoint towards the supervisor while a
//! [`MemoryHandle`] plays the device: it injects inbound lines or
//! notifications, drops the link and inspects what the host wrote.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{ChannelId, TransportKind};
use crate::infrastructure::protocol::Outbound;
use crate::infrastructure::transport::{Channel, ChannelInput};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    inbound: Option<mpsc::UnboundedSender<ChannelInput>>,
    written: Vec<Outbound>,
    open_count: usize,
    failing_opens: usize,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MemoryChannel {
    id: ChannelId,
    kind: TransportKind,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new(id: impl Into<ChannelId>, kind: TransportKind) -> (Self, MemoryHandle) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                id: id.into(),
                kind,
                state: state.clone(),
            },
            MemoryHandle { state },
        )
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> InterpreterResult<mpsc::UnboundedReceiver<ChannelInput>> {
        let mut state = lock(&self.state);
        state.open_count += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(InterpreterError::ChannelUnavailable {
                channel: self.id.clone(),
                reason: "simulated open failure".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        Ok(rx)
    }

    async fn write(&self, command: &Outbound) -> InterpreterResult<()> {
        let mut state = lock(&self.state);
        if state.inbound.is_none() {
            return Err(InterpreterError::WriteFailed {
                channel: self.id.clone(),
                reason: "channel not open".into(),
            });
        }
        state.written.push(command.clone());
        Ok(())
    }

    async fn close(&self) -> InterpreterResult<()> {
        lock(&self.state).inbound = None;
        Ok(())
    }
}

/// Device side of a [`MemoryChannel`].
#[derive(Clone)]
pub struct MemoryHandle {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryHandle {
    fn send(&self, input: ChannelInput) -> bool {
        match &lock(&self.state).inbound {
            Some(tx) => tx.send(input).is_ok(),
            None => false,
        }
    }

    /// Deliver one `identifier:payload` line. Returns false when not open.
    pub fn inject_line(&self, line: &str) -> bool {
        self.send(ChannelInput::Bytes(format!("{}\r\n", line).into_bytes()))
    }

    pub fn inject_bytes(&self, bytes: &[u8]) -> bool {
        self.send(ChannelInput::Bytes(bytes.to_vec()))
    }

    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        self.send(ChannelInput::Notification {
            characteristic,
            value,
        })
    }

    /// Simulate the device vanishing.
    pub fn drop_connection(&self) {
        let inbound = lock(&self.state).inbound.take();
        if let Some(tx) = inbound {
            let _ = tx.send(ChannelInput::Closed {
                reason: "connection dropped".into(),
            });
        }
    }

    /// Make the next `count` opens fail with `ChannelUnavailable`.
    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).failing_opens = count;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).inbound.is_some()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).open_count
    }

    pub fn written(&self) -> Vec<Outbound> {
        lock(&self.state).written.clone()
    }

    /// Every line written so far, in order.
    pub fn written_lines(&self) -> Vec<String> {
        lock(&self.state)
            .written
            .iter()
            .flat_map(|command| command.lines().to_vec())
            .collect()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }
}

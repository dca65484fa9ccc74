//! Serial Channel
//!
//! USB dongle ports and Bluetooth SPP ports both show up as serial devices
//! speaking the line protocol at 500000 baud.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{ChannelId, TransportKind};
use crate::infrastructure::protocol::Outbound;
use crate::infrastructure::transport::{Channel, ChannelInput};
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 1024;

pub struct SerialChannel {
    id: ChannelId,
    kind: TransportKind,
    baud_rate: u32,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SerialChannel {
    /// Serial channel for `path`; `kind` is the dongle or SPP flavour.
    pub fn new(path: impl Into<String>, kind: TransportKind, baud_rate: u32) -> Self {
        Self {
            id: ChannelId::new(path),
            kind,
            baud_rate,
            writer: Mutex::new(None),
            reader: StdMutex::new(None),
        }
    }

    fn open_port(&self) -> InterpreterResult<SerialStream> {
        tokio_serial::new(self.id.as_str(), self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| InterpreterError::ChannelUnavailable {
                channel: self.id.clone(),
                reason: e.to_string(),
            })
    }

    fn stop_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Forward chunks until EOF or error, then report why the stream ended.
async fn read_loop(
    id: ChannelId,
    mut reader: ReadHalf<SerialStream>,
    tx: mpsc::UnboundedSender<ChannelInput>,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let reason = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break "end of stream".to_string(),
            Ok(n) => {
                trace!("{}: {} bytes", id, n);
                if tx.send(ChannelInput::Bytes(buf[..n].to_vec())).is_err() {
                    debug!("{}: inbound receiver dropped", id);
                    return;
                }
            }
            Err(e) => break e.to_string(),
        }
    };
    warn!("Serial port {} closed: {}", id, reason);
    let _ = tx.send(ChannelInput::Closed { reason });
}

#[async_trait]
impl Channel for SerialChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> InterpreterResult<mpsc::UnboundedReceiver<ChannelInput>> {
        self.stop_reader();
        let stream = self.open_port()?;
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(read_loop(self.id.clone(), reader, tx));
        *self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        info!("Opened serial port {} at {} baud", self.id, self.baud_rate);
        Ok(rx)
    }

    async fn write(&self, command: &Outbound) -> InterpreterResult<()> {
        if !matches!(command, Outbound::Lines(_)) {
            return Err(InterpreterError::Unsupported {
                kind: self.kind,
                operation: "characteristic access",
            });
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| InterpreterError::WriteFailed {
                channel: self.id.clone(),
                reason: "port not open".into(),
            })?;

        let write_failed = |e: std::io::Error| InterpreterError::WriteFailed {
            channel: self.id.clone(),
            reason: e.to_string(),
        };

        trace!("{} <- {:?}", self.id, command.lines());
        writer
            .write_all(&command.to_bytes())
            .await
            .map_err(write_failed)?;
        writer.flush().await.map_err(write_failed)
    }

    async fn close(&self) -> InterpreterResult<()> {
        self.stop_reader();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutting down {} failed: {}", self.id, e);
            }
        }
        info!("Closed serial port {}", self.id);
        Ok(())
    }
}

//! Connection Supervisor
//!
//! Owns one task per channel. Each task opens its channel, sends the
//! handshake bursts, keeps a heartbeat going, feeds inbound traffic to the
//! session and reopens after a backoff when the link drops. Stopping a
//! channel wakes its task through a watch flag so pending opens, backoffs
//! and heartbeats are all cancelled at once.

use crate::domain::error::InterpreterError;
use crate::domain::models::{ChannelId, EventSink, MessageSeverity, TrackerEvent, TransportKind};
use crate::domain::session::{self, SharedSession};
use crate::infrastructure::protocol::commands;
use crate::infrastructure::protocol::frame::gatt_frame;
use crate::infrastructure::protocol::LineFramer;
use crate::infrastructure::transport::{Channel, ChannelInput};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timing of the channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
    pub handshake_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            handshake_delay: Duration::from_millis(500),
        }
    }
}

struct Worker {
    channel: Arc<dyn Channel>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Why a connected session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Shutdown,
}

pub struct ConnectionSupervisor {
    session: SharedSession,
    events: EventSink,
    config: SupervisorConfig,
    workers: Mutex<HashMap<ChannelId, Worker>>,
}

impl ConnectionSupervisor {
    pub fn new(session: SharedSession, events: EventSink, config: SupervisorConfig) -> Self {
        Self {
            session,
            events,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, HashMap<ChannelId, Worker>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start supervising `channel`. Returns false if its id is already running.
    pub fn spawn(&self, channel: Arc<dyn Channel>) -> bool {
        let id = channel.id().clone();
        let mut workers = self.workers();
        if workers.contains_key(&id) {
            warn!("Channel {} is already running", id);
            return false;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_channel(
            channel.clone(),
            self.session.clone(),
            self.events.clone(),
            self.config,
            shutdown_rx,
        ));
        workers.insert(
            id,
            Worker {
                channel,
                shutdown,
                handle,
            },
        );
        true
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Arc<dyn Channel>> {
        self.workers().get(id).map(|worker| worker.channel.clone())
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.workers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self) -> bool {
        !self.workers().is_empty()
    }

    /// Stop one channel and wait for its task to wind down.
    pub async fn stop_channel(&self, id: &ChannelId) -> bool {
        let worker = self.workers().remove(id);
        match worker {
            Some(worker) => {
                shutdown_worker(id, worker).await;
                true
            }
            None => false,
        }
    }

    /// Stop every channel of one transport kind.
    pub async fn stop_kind(&self, kind: TransportKind) -> Vec<ChannelId> {
        let stopping: Vec<(ChannelId, Worker)> = {
            let mut workers = self.workers();
            let ids: Vec<ChannelId> = workers
                .iter()
                .filter(|(_, worker)| worker.channel.kind() == kind)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| workers.remove(&id).map(|worker| (id, worker)))
                .collect()
        };
        self.shutdown_all(stopping).await
    }

    /// Stop everything. Calling it again is a no-op.
    pub async fn stop_all(&self) -> Vec<ChannelId> {
        let stopping: Vec<(ChannelId, Worker)> = self.workers().drain().collect();
        self.shutdown_all(stopping).await
    }

    async fn shutdown_all(&self, stopping: Vec<(ChannelId, Worker)>) -> Vec<ChannelId> {
        let mut stopped = Vec::with_capacity(stopping.len());
        for (id, worker) in stopping {
            shutdown_worker(&id, worker).await;
            stopped.push(id);
        }
        stopped
    }
}

async fn shutdown_worker(id: &ChannelId, worker: Worker) {
    let _ = worker.shutdown.send(true);
    if let Err(e) = worker.handle.await {
        if !e.is_cancelled() {
            warn!("Channel task {} ended abnormally: {}", id, e);
        }
    }
    debug!("Channel {} stopped", id);
}

/// Lifecycle loop of one channel: open, serve, back off, repeat.
async fn run_channel(
    channel: Arc<dyn Channel>,
    session: SharedSession,
    events: EventSink,
    config: SupervisorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let id = channel.id().clone();
    let kind = channel.kind();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let opened = tokio::select! {
            result = channel.open() => result,
            _ = shutdown.changed() => break,
        };

        match opened {
            Ok(inbound) => {
                info!("Channel {} ({}) connected", id, kind);
                events.emit(TrackerEvent::Connected {
                    channel: id.clone(),
                    kind,
                });
                events.log(format!("Connected to {}", id), MessageSeverity::Success);

                let end = serve(&channel, inbound, &session, &events, config, &mut shutdown).await;

                if let Err(e) = channel.close().await {
                    debug!("Closing {} failed: {}", id, e);
                }
                session::lock(&session).channel_closed(&id);
                events.emit(TrackerEvent::Disconnected {
                    channel: id.clone(),
                });

                if end == SessionEnd::Shutdown {
                    info!("Channel {} stopped", id);
                    return;
                }
                events.error(&InterpreterError::Disconnected(id.clone()));
            }
            Err(e) => events.error(&e),
        }

        info!(
            "Reconnecting {} in {:?}",
            id, config.reconnect_backoff
        );
        tokio::select! {
            _ = sleep(config.reconnect_backoff) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Channel {} stopped", id);
}

/// Serve one open connection until it drops or shutdown is requested.
async fn serve(
    channel: &Arc<dyn Channel>,
    mut inbound: mpsc::UnboundedReceiver<ChannelInput>,
    session: &SharedSession,
    events: &EventSink,
    config: SupervisorConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let id = channel.id().clone();
    let kind = channel.kind();
    let mut framer = LineFramer::new();

    let handshake = tokio::spawn(handshake(
        channel.clone(),
        events.clone(),
        config.handshake_delay,
    ));

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            input = inbound.recv() => match input {
                Some(ChannelInput::Bytes(bytes)) => {
                    for result in framer.push(&bytes) {
                        match result {
                            Ok(frame) => session::lock(session).handle_frame(&id, frame),
                            Err(e) => events.error(&e),
                        }
                    }
                }
                Some(ChannelInput::Notification { characteristic, value }) => {
                    match gatt_frame(characteristic, value) {
                        Ok(frame) => session::lock(session).handle_frame(&id, frame),
                        Err(e) => events.error(&e),
                    }
                }
                Some(ChannelInput::Closed { reason }) => {
                    warn!("Channel {} lost: {}", id, reason);
                    break SessionEnd::Lost;
                }
                None => {
                    warn!("Channel {} inbound stream ended", id);
                    break SessionEnd::Lost;
                }
            },
            _ = heartbeat.tick() => {
                if let Some(command) = commands::heartbeat(kind) {
                    if let Err(e) = channel.write(&command).await {
                        events.error(&e);
                    }
                }
            }
            _ = shutdown.changed() => break SessionEnd::Shutdown,
        }
    };

    handshake.abort();
    end
}

/// Initial request burst, then device info/battery and the first burst again.
async fn handshake(channel: Arc<dyn Channel>, events: EventSink, delay: Duration) {
    let kind = channel.kind();
    let first = commands::initial_burst(kind);

    for command in &first {
        if let Err(e) = channel.write(command).await {
            events.error(&e);
        }
    }

    sleep(delay).await;

    for command in commands::info_burst(kind).iter().chain(first.iter()) {
        if let Err(e) = channel.write(command).await {
            events.error(&e);
        }
    }
    debug!("Handshake with {} sent", channel.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TrackerIdentity;
    use crate::domain::session::Session;
    use crate::domain::tracker::TrackerSettings;
    use crate::infrastructure::transport::{MemoryChannel, MemoryHandle};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(5),
            handshake_delay: Duration::from_millis(500),
        }
    }

    fn supervisor() -> (
        ConnectionSupervisor,
        SharedSession,
        UnboundedReceiver<TrackerEvent>,
    ) {
        let (events, rx) = EventSink::channel();
        let session = Session::new(
            events.clone(),
            TrackerIdentity::LOWER_BODY.to_vec(),
            TrackerSettings::default(),
        )
        .shared();
        (
            ConnectionSupervisor::new(session.clone(), events, config()),
            session,
            rx,
        )
    }

    fn memory(
        session: &SharedSession,
        id: &str,
        kind: TransportKind,
    ) -> (Arc<dyn Channel>, MemoryHandle) {
        let (channel, handle) = MemoryChannel::new(id, kind);
        session::lock(session).register_channel(&ChannelId::from(id), kind, None);
        (Arc::new(channel), handle)
    }

    /// Next event that is not a log line.
    async fn next_lifecycle(rx: &mut UnboundedReceiver<TrackerEvent>) -> TrackerEvent {
        loop {
            match rx.recv().await.unwrap() {
                TrackerEvent::Log(_) => continue,
                event => return event,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_bursts_and_heartbeat() {
        let (supervisor, session, mut rx) = supervisor();
        let (channel, handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        supervisor.spawn(channel);

        assert!(matches!(
            next_lifecycle(&mut rx).await,
            TrackerEvent::Connected { .. }
        ));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(
            handle.written_lines(),
            vec![
                "r0:", "r1:", "o0:", "o1:", "i:", "i0:", "i1:", "v0:", "v1:", "r0:", "r1:",
                "o0:", "o1:"
            ]
        );

        handle.clear_written();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(handle.written_lines(), vec!["i:"]);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_reach_session() {
        let (supervisor, session, mut rx) = supervisor();
        let (channel, handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        supervisor.spawn(channel);
        next_lifecycle(&mut rx).await;

        handle.inject_bytes(b"r0:1100");
        handle.inject_bytes(b"60800\r\n");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(
            session::lock(&session).assignments()[0].0,
            TrackerIdentity::Hip
        );
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reopens_once_after_backoff() {
        let (supervisor, session, mut rx) = supervisor();
        let (channel, handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        supervisor.spawn(channel);
        next_lifecycle(&mut rx).await;
        assert_eq!(handle.open_count(), 1);

        handle.drop_connection();
        assert!(matches!(
            next_lifecycle(&mut rx).await,
            TrackerEvent::Disconnected { .. }
        ));
        let dropped_at = Instant::now();

        assert!(matches!(
            next_lifecycle(&mut rx).await,
            TrackerEvent::Connected { .. }
        ));
        assert!(dropped_at.elapsed() >= config().reconnect_backoff);
        assert_eq!(handle.open_count(), 2);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.open_count(), 2);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_is_retried() {
        let (supervisor, session, mut rx) = supervisor();
        let (channel, handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        handle.fail_next_opens(1);
        supervisor.spawn(channel);

        match rx.recv().await.unwrap() {
            TrackerEvent::Log(message) => assert!(message.is_exceptional()),
            other => panic!("expected error log, got {:?}", other),
        }
        assert!(matches!(
            next_lifecycle(&mut rx).await,
            TrackerEvent::Connected { .. }
        ));
        assert_eq!(handle.open_count(), 2);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_reopen() {
        let (supervisor, session, mut rx) = supervisor();
        let (channel, handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        supervisor.spawn(channel);
        next_lifecycle(&mut rx).await;

        handle.drop_connection();
        next_lifecycle(&mut rx).await;
        supervisor.stop_all().await;

        sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.open_count(), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_disconnects_once() {
        let (supervisor, session, mut rx) = supervisor();
        let (channel, handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        supervisor.spawn(channel);
        next_lifecycle(&mut rx).await;

        assert_eq!(supervisor.stop_all().await, vec![ChannelId::from("COM3")]);
        assert!(supervisor.stop_all().await.is_empty());
        assert!(!handle.is_open());

        let mut disconnects = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TrackerEvent::Disconnected { .. }) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_spawn_is_rejected() {
        let (supervisor, session, _rx) = supervisor();
        let (first, _handle) = memory(&session, "COM3", TransportKind::DongleSerial);
        let (second, _other) = memory(&session, "COM3", TransportKind::DongleSerial);
        assert!(supervisor.spawn(first));
        assert!(!supervisor.spawn(second));
        supervisor.stop_all().await;
    }
}

//! Tracker Interpreter Service
//!
//! The public surface: starts and stops transports, turns application
//! commands into protocol traffic and hands out state snapshots. Everything
//! else reaches the application through the event receiver returned by
//! [`TrackerInterpreter::new`].

use crate::domain::assignment::Binding;
use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{
    ChannelId, EventSink, MessageSeverity, SubPort, TrackerEvent, TrackerIdentity, TransportKind,
};
use crate::domain::pairing::PairingPhase;
use crate::domain::session::{self, Session, SharedSession};
use crate::domain::settings::Settings;
use crate::domain::tracker::{TrackerRuntimeState, TrackerSettings};
use crate::infrastructure::protocol::commands::{self, Outbound};
use crate::infrastructure::supervisor::{ConnectionSupervisor, SupervisorConfig};
use crate::infrastructure::transport::Channel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

type RequestBuilder = fn(TransportKind, SubPort) -> Vec<Outbound>;

/// Main service coordinating transports, session state and commands
pub struct TrackerInterpreter {
    settings: Settings,
    session: SharedSession,
    supervisor: ConnectionSupervisor,
    events: EventSink,
}

impl TrackerInterpreter {
    /// Create the interpreter and the receiver its events arrive on
    pub fn new(settings: Settings) -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (events, receiver) = EventSink::channel();
        let session = Session::new(
            events.clone(),
            settings.required_trackers.clone(),
            settings.default_tracker_settings,
        )
        .shared();
        let supervisor = ConnectionSupervisor::new(
            session.clone(),
            events.clone(),
            SupervisorConfig {
                heartbeat_interval: settings.heartbeat_interval(),
                reconnect_backoff: settings.reconnect_backoff(),
                handshake_delay: settings.handshake_delay(),
            },
        );

        (
            Self {
                settings,
                session,
                supervisor,
                events,
            },
            receiver,
        )
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Emit the error as a diagnostic and hand it back for propagation.
    fn report(&self, error: InterpreterError) -> InterpreterError {
        self.events.error(&error);
        error
    }

    // ---- Lifecycle ----

    /// Supervise an already-built channel. `fixed` pins a single-tracker
    /// channel to its identity. Returns false if the id is already running.
    pub fn start_with(&self, channel: Arc<dyn Channel>, fixed: Option<TrackerIdentity>) -> bool {
        let id = channel.id().clone();
        if self.supervisor.channel(&id).is_some() {
            warn!("Channel {} is already running", id);
            return false;
        }
        session::lock(&self.session).register_channel(&id, channel.kind(), fixed);
        self.supervisor.spawn(channel)
    }

    /// Start every configured dongle and SPP port.
    #[cfg(feature = "serial")]
    pub fn start_serial(&self) -> usize {
        use crate::infrastructure::transport::SerialChannel;

        let dongles = self
            .settings
            .serial_ports
            .iter()
            .map(|path| (path, TransportKind::DongleSerial, None));
        let spp = self
            .settings
            .spp_ports
            .iter()
            .map(|port| (&port.path, TransportKind::BtSpp, port.identity));

        let mut started = 0;
        for (path, kind, fixed) in dongles.chain(spp) {
            let channel = SerialChannel::new(path.clone(), kind, self.settings.baud_rate);
            if self.start_with(Arc::new(channel), fixed) {
                started += 1;
            }
        }
        info!("Started {} serial channels", started);
        started
    }

    /// Start every configured BLE tracker. With none configured, scan and
    /// report what was found instead.
    #[cfg(feature = "ble")]
    pub async fn start_ble(&self) -> InterpreterResult<usize> {
        use crate::infrastructure::transport::{scanner, BleChannel};

        let adapter = scanner::default_adapter()
            .await
            .map_err(|e| self.report(e))?;

        if self.settings.ble_trackers.is_empty() {
            let found = scanner::scan_ble_trackers(
                &adapter,
                &self.settings.ble_name_prefix,
                self.settings.ble_scan_duration(),
            )
            .await
            .map_err(|e| self.report(e))?;
            for tracker in &found {
                self.events.log(
                    format!(
                        "Found {} at {}; assign it a tracker in ble_trackers to use it",
                        tracker.name, tracker.address
                    ),
                    MessageSeverity::Warning,
                );
            }
            return Ok(0);
        }

        let mut started = 0;
        for (address, identity) in &self.settings.ble_trackers {
            let channel = BleChannel::new(
                adapter.clone(),
                address.clone(),
                self.settings.ble_scan_duration(),
            );
            if self.start_with(Arc::new(channel), Some(*identity)) {
                started += 1;
            }
        }
        info!("Started {} BLE channels", started);
        Ok(started)
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.supervisor.channel_ids()
    }

    /// Stop every channel. A second call does nothing.
    pub async fn stop(&self) {
        let stopped = self.supervisor.stop_all().await;
        self.forget(&stopped);
    }

    /// Stop the channels of one transport kind.
    pub async fn stop_transport(&self, kind: TransportKind) {
        let stopped = self.supervisor.stop_kind(kind).await;
        self.forget(&stopped);
    }

    /// Stop a single channel. Returns false when it was not running.
    pub async fn stop_channel(&self, id: &ChannelId) -> bool {
        if !self.supervisor.stop_channel(id).await {
            return false;
        }
        self.forget(std::slice::from_ref(id));
        true
    }

    fn forget(&self, stopped: &[ChannelId]) {
        if stopped.is_empty() {
            debug!("Nothing to stop");
            return;
        }
        let mut session = session::lock(&self.session);
        for id in stopped {
            session.unregister_channel(id);
        }
        info!("Stopped {} channels", stopped.len());
        self.events
            .log(format!("Stopped {} channels", stopped.len()), MessageSeverity::Info);
    }

    // ---- Writing ----

    fn ensure_running(&self) -> InterpreterResult<()> {
        if self.supervisor.is_running() {
            Ok(())
        } else {
            Err(self.report(InterpreterError::NotStarted))
        }
    }

    fn channel(&self, id: &ChannelId) -> InterpreterResult<Arc<dyn Channel>> {
        self.ensure_running()?;
        self.supervisor
            .channel(id)
            .ok_or_else(|| self.report(InterpreterError::UnknownChannel(id.clone())))
    }

    /// Radio and pairing control only exists on dongles.
    fn dongle_channel(
        &self,
        id: &ChannelId,
        operation: &'static str,
    ) -> InterpreterResult<Arc<dyn Channel>> {
        let channel = self.channel(id)?;
        if channel.kind() != TransportKind::DongleSerial {
            return Err(self.report(InterpreterError::Unsupported {
                kind: channel.kind(),
                operation,
            }));
        }
        Ok(channel)
    }

    async fn write_all(
        &self,
        channel: &Arc<dyn Channel>,
        commands: &[Outbound],
    ) -> InterpreterResult<()> {
        for command in commands {
            channel
                .write(command)
                .await
                .map_err(|e| self.report(e))?;
        }
        Ok(())
    }

    /// Write `lines` one at a time, `delay` apart.
    async fn write_paced(
        &self,
        channel: &Arc<dyn Channel>,
        lines: Vec<String>,
    ) -> InterpreterResult<()> {
        let delay = self.settings.pairing_step_delay();
        for (step, line) in lines.into_iter().enumerate() {
            if step > 0 {
                sleep(delay).await;
            }
            channel
                .write(&Outbound::line(line))
                .await
                .map_err(|e| self.report(e))?;
        }
        Ok(())
    }

    // ---- Settings ----

    /// Apply settings to one tracker.
    pub async fn set_tracker_settings(
        &self,
        identity: TrackerIdentity,
        settings: TrackerSettings,
    ) -> InterpreterResult<()> {
        self.ensure_running()?;
        let (channel_id, commands) = session::lock(&self.session)
            .settings_commands(identity, &settings)
            .map_err(|e| self.report(e))?;
        let channel = self.channel(&channel_id)?;
        self.write_all(&channel, &commands).await?;

        session::lock(&self.session).record_settings(identity, settings);
        info!("Applied settings to {}", identity);
        Ok(())
    }

    /// Apply the same settings to every channel. Channels that fail are
    /// reported; the first failure is returned after the rest were tried.
    pub async fn set_all_tracker_settings(
        &self,
        settings: TrackerSettings,
    ) -> InterpreterResult<()> {
        self.ensure_running()?;
        let plan = session::lock(&self.session).broadcast_commands(&settings);

        let mut first_error = None;
        for (channel_id, commands, identities) in plan {
            let written = match self.channel(&channel_id) {
                Ok(channel) => self.write_all(&channel, &commands).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {
                    let mut session = session::lock(&self.session);
                    for identity in identities {
                        session.record_settings(identity, settings);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Switch a dongle channel to another radio channel (0-10).
    pub async fn set_radio_channel(&self, channel_id: &ChannelId, radio: u8) -> InterpreterResult<()> {
        let line = commands::restore_channel(radio).map_err(|e| self.report(e))?;
        let channel = self.dongle_channel(channel_id, "radio channel selection")?;
        self.write_all(&channel, &[Outbound::line(line)]).await?;
        info!("Radio channel of {} set to {}", channel_id, radio);
        Ok(())
    }

    // ---- Pairing ----

    /// Pair whatever tracker answers on `subport` of a dongle channel.
    ///
    /// Resolves to the identity the tracker acknowledged with; on timeout
    /// the assignment table is left as it was.
    pub async fn pair(
        &self,
        channel_id: &ChannelId,
        subport: SubPort,
        radio: u8,
    ) -> InterpreterResult<TrackerIdentity> {
        let sequence = commands::pair_sequence(subport, radio).map_err(|e| self.report(e))?;
        let finish =
            commands::finish_pairing_sequence(subport, radio).map_err(|e| self.report(e))?;
        let channel = self.dongle_channel(channel_id, "pairing")?;

        let completion = session::lock(&self.session)
            .pairing_mut()
            .begin(channel_id, subport)
            .map_err(|e| self.report(e))?;
        info!("Pairing on {} port {} (radio channel {})", channel_id, subport, radio);
        self.events.log(
            format!("Pairing on {} port {}", channel_id, subport),
            MessageSeverity::Info,
        );

        if let Err(e) = self.write_paced(&channel, sequence).await {
            session::lock(&self.session).pairing_mut().abandon(channel_id);
            return Err(e);
        }
        session::lock(&self.session)
            .pairing_mut()
            .await_ack(channel_id);

        match timeout(self.settings.pairing_timeout(), completion).await {
            Ok(Ok(identity)) => {
                if let Err(e) = self.write_paced(&channel, finish).await {
                    warn!("Finishing pairing of {} failed: {}", identity, e);
                }
                self.events
                    .log(format!("Paired {}", identity), MessageSeverity::Success);
                Ok(identity)
            }
            Ok(Err(_)) => Err(self.report(InterpreterError::Disconnected(channel_id.clone()))),
            Err(_) => {
                session::lock(&self.session)
                    .pairing_mut()
                    .abandon(channel_id);
                Err(self.report(InterpreterError::PairingTimeout {
                    channel: channel_id.clone(),
                    subport,
                }))
            }
        }
    }

    /// Unpair the tracker on `subport` and free its slot.
    pub async fn unpair(
        &self,
        channel_id: &ChannelId,
        subport: SubPort,
        radio: u8,
    ) -> InterpreterResult<Option<TrackerIdentity>> {
        let sequence = commands::unpair_sequence(subport, radio).map_err(|e| self.report(e))?;
        let channel = self.dongle_channel(channel_id, "unpairing")?;
        if session::lock(&self.session).pairing().phase(channel_id) != PairingPhase::Idle {
            return Err(self.report(InterpreterError::PairingInProgress(channel_id.clone())));
        }

        self.write_paced(&channel, sequence).await?;

        let identity = session::lock(&self.session).complete_unpair(channel_id, subport);
        if identity.is_none() {
            warn!("No tracker was assigned to {} port {}", channel_id, subport);
        }
        Ok(identity)
    }

    // ---- Queries ----

    async fn request(&self, identity: TrackerIdentity, build: RequestBuilder) -> InterpreterResult<()> {
        self.ensure_running()?;

        if identity == TrackerIdentity::Dongle {
            let dongles: Vec<ChannelId> = {
                let session = session::lock(&self.session);
                self.supervisor
                    .channel_ids()
                    .into_iter()
                    .filter(|id| session.channel_kind(id) == Some(TransportKind::DongleSerial))
                    .collect()
            };
            if dongles.is_empty() {
                return Err(self.report(InterpreterError::NotAssigned(identity)));
            }
            for id in dongles {
                let channel = self.channel(&id)?;
                self.write_all(&channel, &build(TransportKind::DongleSerial, SubPort::Dongle))
                    .await?;
            }
            return Ok(());
        }

        let (binding, kind) = session::lock(&self.session)
            .target(identity)
            .map_err(|e| self.report(e))?;
        let channel = self.channel(&binding.channel)?;
        self.write_all(&channel, &build(kind, binding.subport)).await
    }

    pub async fn request_device_info(&self, identity: TrackerIdentity) -> InterpreterResult<()> {
        self.request(identity, commands::request_device_info).await
    }

    pub async fn request_battery(&self, identity: TrackerIdentity) -> InterpreterResult<()> {
        self.request(identity, commands::request_battery).await
    }

    pub async fn request_settings(&self, identity: TrackerIdentity) -> InterpreterResult<()> {
        self.request(identity, commands::request_settings).await
    }

    pub async fn request_buttons(&self, identity: TrackerIdentity) -> InterpreterResult<()> {
        self.request(identity, commands::request_buttons).await
    }

    pub fn tracker_state(&self, identity: TrackerIdentity) -> Option<TrackerRuntimeState> {
        session::lock(&self.session).tracker_state(identity)
    }

    pub fn active_trackers(&self) -> Vec<TrackerIdentity> {
        session::lock(&self.session).active_trackers()
    }

    pub fn assignments(&self) -> Vec<(TrackerIdentity, Binding)> {
        session::lock(&self.session).assignments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::{MemoryChannel, MemoryHandle};
    use std::time::Duration;

    fn interpreter() -> (TrackerInterpreter, mpsc::UnboundedReceiver<TrackerEvent>) {
        let settings = Settings {
            required_trackers: Vec::new(),
            pairing_timeout_ms: 10_000,
            ..Settings::default()
        };
        TrackerInterpreter::new(settings)
    }

    async fn start_dongle(interpreter: &TrackerInterpreter, id: &str) -> MemoryHandle {
        let (channel, handle) = MemoryChannel::new(id, TransportKind::DongleSerial);
        assert!(interpreter.start_with(Arc::new(channel), None));
        // Let the handshake finish so only new writes remain
        sleep(Duration::from_millis(600)).await;
        handle.clear_written();
        handle
    }

    fn control_lines(handle: &MemoryHandle) -> Vec<String> {
        handle
            .written_lines()
            .into_iter()
            .filter(|line| line.starts_with("o:"))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_before_start_fail() {
        let (interpreter, mut rx) = interpreter();
        assert_eq!(
            interpreter
                .set_radio_channel(&ChannelId::from("COM3"), 2)
                .await,
            Err(InterpreterError::NotStarted)
        );
        match rx.try_recv().unwrap() {
            TrackerEvent::Log(message) => assert!(message.is_exceptional()),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_radio_channel_writes_nothing() {
        let (interpreter, _rx) = interpreter();
        let handle = start_dongle(&interpreter, "COM3").await;
        let com3 = ChannelId::from("COM3");

        assert_eq!(
            interpreter.set_radio_channel(&com3, 11).await,
            Err(InterpreterError::InvalidChannelNumber(11))
        );
        assert_eq!(
            interpreter.pair(&com3, SubPort::Port0, 42).await,
            Err(InterpreterError::InvalidChannelNumber(42))
        );
        assert!(handle.written().is_empty());

        interpreter.set_radio_channel(&com3, 10).await.unwrap();
        assert_eq!(handle.written_lines(), vec!["o:30a0"]);
        interpreter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_completes_on_acknowledgement() {
        let (interpreter, mut rx) = interpreter();
        let handle = start_dongle(&interpreter, "COM3").await;
        let com3 = ChannelId::from("COM3");

        let (result, _) = tokio::join!(interpreter.pair(&com3, SubPort::Port1, 3), async {
            sleep(Duration::from_millis(2500)).await;
            handle.inject_line("r1:113010800");
        });

        assert_eq!(result, Ok(TrackerIdentity::Chest));
        assert_eq!(
            control_lines(&handle),
            vec!["o:3030", "o:1130", "o:3030", "o:3030"]
        );
        assert_eq!(
            interpreter.assignments(),
            vec![(
                TrackerIdentity::Chest,
                Binding::new(com3.clone(), SubPort::Port1)
            )]
        );

        let mut paired = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TrackerEvent::Paired { .. }) {
                paired += 1;
            }
        }
        assert_eq!(paired, 1);
        interpreter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_pair_is_rejected_and_timeout_leaves_table() {
        let (interpreter, _rx) = interpreter();
        let handle = start_dongle(&interpreter, "COM3").await;
        let com3 = ChannelId::from("COM3");

        let (first, second) = tokio::join!(
            interpreter.pair(&com3, SubPort::Port0, 3),
            interpreter.pair(&com3, SubPort::Port1, 3)
        );
        assert_eq!(
            second,
            Err(InterpreterError::PairingInProgress(com3.clone()))
        );
        assert_eq!(
            first,
            Err(InterpreterError::PairingTimeout {
                channel: com3.clone(),
                subport: SubPort::Port0
            })
        );
        assert!(interpreter.assignments().is_empty());

        // The channel is free again after the timeout
        let (retry, _) = tokio::join!(interpreter.pair(&com3, SubPort::Port0, 3), async {
            sleep(Duration::from_millis(2500)).await;
            handle.inject_line("r0:113060800");
        });
        assert_eq!(retry, Ok(TrackerIdentity::Hip));
        interpreter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpair_frees_slot() {
        let (interpreter, _rx) = interpreter();
        let handle = start_dongle(&interpreter, "COM3").await;
        let com3 = ChannelId::from("COM3");
        handle.inject_line("r0:110060800");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(interpreter.assignments().len(), 1);

        let unpaired = interpreter.unpair(&com3, SubPort::Port0, 3).await;
        assert_eq!(unpaired, Ok(Some(TrackerIdentity::Hip)));
        assert_eq!(control_lines(&handle), vec!["o:2030", "o:3030"]);
        assert!(interpreter.assignments().is_empty());
        interpreter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_and_requests_reach_the_right_port() {
        let (interpreter, _rx) = interpreter();
        let handle = start_dongle(&interpreter, "COM3").await;
        handle.inject_line("r1:110030800");
        sleep(Duration::from_millis(10)).await;
        handle.clear_written();

        let settings = TrackerSettings {
            ankle_motion_detection: true,
            ..TrackerSettings::default()
        };
        interpreter
            .set_tracker_settings(TrackerIdentity::LeftAnkle, settings)
            .await
            .unwrap();
        interpreter
            .request_battery(TrackerIdentity::LeftAnkle)
            .await
            .unwrap();
        interpreter
            .request_device_info(TrackerIdentity::Dongle)
            .await
            .unwrap();

        assert_eq!(
            handle.written(),
            vec![
                Outbound::Lines(vec![
                    "o0:00000000101000".to_string(),
                    "o1:00000000101001".to_string()
                ]),
                Outbound::line("v1:"),
                Outbound::line("i:"),
            ]
        );
        assert_eq!(
            interpreter
                .tracker_state(TrackerIdentity::LeftAnkle)
                .unwrap()
                .settings,
            Some(settings)
        );
        assert_eq!(
            interpreter.request_battery(TrackerIdentity::Hip).await,
            Err(InterpreterError::NotAssigned(TrackerIdentity::Hip))
        );
        interpreter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_transport_only_stops_that_kind() {
        let (interpreter, _rx) = interpreter();
        let _dongle = start_dongle(&interpreter, "COM3").await;
        let (spp, _spp_handle) = MemoryChannel::new("COM9", TransportKind::BtSpp);
        assert!(interpreter.start_with(Arc::new(spp), Some(TrackerIdentity::Hip)));
        assert!(!interpreter.start_with(
            Arc::new(MemoryChannel::new("COM9", TransportKind::BtSpp).0),
            None
        ));

        interpreter.stop_transport(TransportKind::BtSpp).await;
        assert_eq!(interpreter.channels(), vec![ChannelId::from("COM3")]);
        interpreter.stop().await;
        interpreter.stop().await;
        assert!(!interpreter.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_channel_leaves_the_others_running() {
        let (interpreter, _rx) = interpreter();
        let com3 = start_dongle(&interpreter, "COM3").await;
        let _com4 = start_dongle(&interpreter, "COM4").await;

        assert!(interpreter.stop_channel(&ChannelId::from("COM3")).await);
        assert!(!com3.is_open());
        assert_eq!(interpreter.channels(), vec![ChannelId::from("COM4")]);
        assert!(!interpreter.stop_channel(&ChannelId::from("COM3")).await);
        assert_eq!(
            interpreter.set_radio_channel(&ChannelId::from("COM3"), 2).await,
            Err(InterpreterError::UnknownChannel(ChannelId::from("COM3")))
        );
        assert!(interpreter.is_running());
        interpreter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_is_refused_on_pinned_spp_channel() {
        let (interpreter, _rx) = interpreter();
        let (spp, handle) = MemoryChannel::new("COM9", TransportKind::BtSpp);
        assert!(interpreter.start_with(Arc::new(spp), Some(TrackerIdentity::Hip)));
        sleep(Duration::from_millis(600)).await;
        handle.clear_written();
        let com9 = ChannelId::from("COM9");

        assert_eq!(
            interpreter.pair(&com9, SubPort::Port0, 3).await,
            Err(InterpreterError::Unsupported {
                kind: TransportKind::BtSpp,
                operation: "pairing",
            })
        );
        assert_eq!(
            interpreter.unpair(&com9, SubPort::Port0, 3).await,
            Err(InterpreterError::Unsupported {
                kind: TransportKind::BtSpp,
                operation: "unpairing",
            })
        );
        assert!(handle.written().is_empty());
        assert_eq!(
            session::lock(&interpreter.session).pairing().phase(&com9),
            PairingPhase::Idle
        );
        interpreter.stop().await;
    }
}

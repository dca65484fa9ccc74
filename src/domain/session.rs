//! Session registry
//!
//! The one place shared protocol state lives: the assignment table and
//! pending queue, per-tracker runtime state, pairing sessions and the set of
//! registered channels. Channel tasks hand every frame to
//! [`Session::handle_frame`]; the facade asks it to build outbound commands.
//!
//! The session sits behind a `std::sync::Mutex` and never awaits.

use crate::domain::assignment::{Admission, Binding, Resolver};
use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{
    ButtonState, ChannelId, EventSink, MessageSeverity, SubPort, TrackerEvent, TrackerIdentity,
    TransportKind,
};
use crate::domain::pairing::{PairingAck, PairingBook};
use crate::domain::tracker::{AutoCorrection, Fps, SensorMode, TrackerRuntimeState, TrackerSettings};
use crate::infrastructure::protocol::codec;
use crate::infrastructure::protocol::commands::{self, Outbound};
use crate::infrastructure::protocol::gatt::names;
use crate::infrastructure::protocol::imu;
use crate::infrastructure::protocol::{Frame, FrameKind, Payload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

pub type SharedSession = Arc<Mutex<Session>>;

/// Lock the session, recovering the state if a holder panicked.
pub fn lock(session: &SharedSession) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
struct ChannelEntry {
    kind: TransportKind,
    /// Channels that only ever carry one known tracker skip resolution.
    fixed: Option<TrackerIdentity>,
}

impl ChannelEntry {
    fn is_multiplexed(&self) -> bool {
        self.kind.is_line_protocol() && self.fixed.is_none()
    }
}

pub struct Session {
    resolver: Resolver,
    trackers: HashMap<TrackerIdentity, TrackerRuntimeState>,
    pairing: PairingBook,
    channels: HashMap<ChannelId, ChannelEntry>,
    events: EventSink,
    default_settings: TrackerSettings,
}

impl Session {
    pub fn new(
        events: EventSink,
        required: Vec<TrackerIdentity>,
        default_settings: TrackerSettings,
    ) -> Self {
        Self {
            resolver: Resolver::new(required),
            trackers: HashMap::new(),
            pairing: PairingBook::new(),
            channels: HashMap::new(),
            events,
            default_settings,
        }
    }

    pub fn shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    // ---- Channel registry ----

    pub fn register_channel(
        &mut self,
        channel: &ChannelId,
        kind: TransportKind,
        fixed: Option<TrackerIdentity>,
    ) {
        if self.channels.is_empty() {
            self.resolver.restart();
        }
        if let Some(identity) = fixed {
            let table = self.resolver.table_mut();
            table.unbind(identity);
            if let Err(conflict) = table.bind(identity, Binding::new(channel.clone(), SubPort::Port0))
            {
                warn!("Could not pin {} to {}: {:?}", identity, channel, conflict);
            }
        }
        self.channels
            .insert(channel.clone(), ChannelEntry { kind, fixed });
        self.update_multiplexed();
        debug!("Registered {} channel {}", kind, channel);
    }

    pub fn unregister_channel(&mut self, channel: &ChannelId) {
        let Some(entry) = self.channels.remove(channel) else {
            return;
        };
        self.pairing.abandon(channel);
        if let Some(identity) = entry.fixed {
            self.resolver.table_mut().unbind(identity);
        }
        self.update_multiplexed();
    }

    fn update_multiplexed(&mut self) {
        let multiplexed: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.is_multiplexed())
            .map(|(id, _)| id.clone())
            .collect();
        self.resolver.set_multiplexed(multiplexed);
    }

    pub fn channel_kind(&self, channel: &ChannelId) -> Option<TransportKind> {
        self.channels.get(channel).map(|entry| entry.kind)
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The channel's transport went away: its trackers go offline and any
    /// pairing on it is abandoned. Bindings survive for the reconnect.
    pub fn channel_closed(&mut self, channel: &ChannelId) {
        if self.pairing.abandon(channel) {
            warn!("Pairing on {} abandoned: channel closed", channel);
        }
        for identity in self.resolver.table().identities_on(channel) {
            self.mark_lost(identity);
        }
    }

    // ---- Inbound pipeline ----

    /// Attribute one frame to a tracker and emit what it carries.
    pub fn handle_frame(&mut self, channel: &ChannelId, frame: Frame) {
        let Some(entry) = self.channels.get(channel).copied() else {
            debug!("Frame from unregistered channel {} dropped", channel);
            return;
        };

        if let Some(identity) = entry.fixed {
            self.process(identity, frame);
            return;
        }

        if frame.kind() == FrameKind::Button {
            self.observe_acknowledgement(channel, &frame);
        }

        match self.resolver.admit(channel, frame) {
            Admission::Dispatch(frame) => self.dispatch(channel, frame),
            Admission::Queued | Admission::Dropped => {}
            Admission::Replay(frames) => {
                for pending in frames {
                    self.dispatch(&pending.channel, pending.frame);
                }
            }
            Admission::Abandoned { discarded } => {
                self.events.log(
                    format!(
                        "Tracker assignment incomplete; {} queued frames discarded",
                        discarded
                    ),
                    MessageSeverity::Warning,
                );
            }
        }
    }

    fn observe_acknowledgement(&mut self, channel: &ChannelId, frame: &Frame) {
        if let (Some(subport), Some(payload)) = (frame.subport(), frame.text()) {
            if let Some(ack) = self.pairing.observe_ack(channel, subport, payload) {
                self.complete_pairing(ack);
            }
        }
        self.resolver.observe(channel, frame);
    }

    fn complete_pairing(&mut self, ack: PairingAck) {
        let binding = Binding::new(ack.channel.clone(), ack.subport);
        let table = self.resolver.table_mut();
        table.unbind(ack.identity);
        if let Some(previous) = table.unbind_slot(&binding) {
            info!("{} replaces {} on {} port {}", ack.identity, previous, ack.channel, ack.subport);
        }
        if let Err(conflict) = table.bind(ack.identity, binding) {
            warn!("Paired {} could not be bound: {:?}", ack.identity, conflict);
            return;
        }

        info!("Paired {} on {} port {}", ack.identity, ack.channel, ack.subport);
        self.events.emit(TrackerEvent::Paired {
            identity: ack.identity,
            channel: ack.channel,
            subport: ack.subport,
        });
    }

    fn dispatch(&mut self, channel: &ChannelId, frame: Frame) {
        let identity = match frame.subport() {
            None => {
                self.events.error(&InterpreterError::UnknownIdentifier(
                    frame.identifier().to_string(),
                ));
                return;
            }
            Some(SubPort::Dongle) => TrackerIdentity::Dongle,
            Some(subport) => match self.resolver.table().identity_at(channel, subport) {
                Some(identity) => identity,
                None => {
                    trace!(
                        "{} on unassigned slot {}/{} dropped",
                        frame.identifier(),
                        channel,
                        subport
                    );
                    return;
                }
            },
        };
        self.process(identity, frame);
    }

    fn process(&mut self, identity: TrackerIdentity, frame: Frame) {
        let result = match frame.kind() {
            FrameKind::Orientation => self.on_orientation(identity, &frame),
            FrameKind::Telemetry => {
                self.on_telemetry(identity, &frame);
                Ok(())
            }
            FrameKind::Button => self.on_button(identity, &frame),
            FrameKind::Battery => self.on_battery(identity, &frame),
            FrameKind::Settings => self.on_settings(identity, &frame),
            FrameKind::Info => self.on_info(identity, &frame),
            FrameKind::Unknown => Err(InterpreterError::UnknownIdentifier(
                frame.identifier().to_string(),
            )),
        };
        if let Err(error) = result {
            self.events.error(&error);
        }
    }

    fn mark_live(&mut self, identity: TrackerIdentity) {
        if identity == TrackerIdentity::Dongle {
            return;
        }
        let state = self.trackers.entry(identity).or_default();
        if !state.connected {
            state.connected = true;
            info!("Tracker {} connected", identity);
            self.events.emit(TrackerEvent::TrackerConnected(identity));
        }
    }

    fn mark_lost(&mut self, identity: TrackerIdentity) {
        let Some(state) = self.trackers.get_mut(&identity) else {
            return;
        };
        let was_connected = state.connected;
        state.reset();
        if was_connected {
            info!("Tracker {} disconnected", identity);
            self.events.emit(TrackerEvent::TrackerDisconnected(identity));
        }
    }

    fn on_orientation(&mut self, identity: TrackerIdentity, frame: &Frame) -> InterpreterResult<()> {
        let bytes = match frame.payload() {
            Payload::Text(text) => imu::decode_base64(text)?,
            Payload::Binary(bytes) => bytes.clone(),
        };
        let decoded = imu::decode_orientation(identity, &bytes)?;

        for (tracker, sample) in decoded.into_samples(identity) {
            self.mark_live(tracker);
            self.trackers.entry(tracker).or_default().imu = Some(sample);
            self.events.emit(TrackerEvent::Imu {
                identity: tracker,
                sample,
            });
        }
        Ok(())
    }

    fn on_telemetry(&mut self, identity: TrackerIdentity, frame: &Frame) {
        let payload = frame.payload_string();
        if codec::is_searching(&payload) {
            debug!("{} is searching for the dongle", identity);
            self.mark_lost(identity);
            return;
        }
        self.mark_live(identity);
        self.events
            .emit(TrackerEvent::Tracker { identity, payload });
    }

    fn on_button(&mut self, identity: TrackerIdentity, frame: &Frame) -> InterpreterResult<()> {
        let state = self.trackers.entry(identity).or_default();
        let (main, sub, raw) = match frame.payload() {
            Payload::Text(payload) => {
                let (main, sub) = codec::decode_buttons(payload)?;
                (main, sub, payload.clone())
            }
            Payload::Binary(value) => {
                let count = codec::decode_ble_byte(value)?;
                let (main, sub) = match frame.identifier() {
                    names::SECONDARY_BUTTON => (state.buttons.main, count),
                    _ => (count, state.buttons.sub),
                };
                (main, sub, format!("{:x}:{:x}", main, sub))
            }
        };

        if state.raw_buttons.as_deref() == Some(raw.as_str()) {
            return Ok(());
        }
        state.raw_buttons = Some(raw);
        state.buttons = ButtonState {
            main,
            sub,
            powered_on: state.connected,
        };
        self.events.emit(TrackerEvent::Button {
            identity,
            state: state.buttons,
        });
        Ok(())
    }

    fn on_battery(&mut self, identity: TrackerIdentity, frame: &Frame) -> InterpreterResult<()> {
        let state = self.trackers.entry(identity).or_default();
        match frame.payload() {
            Payload::Text(payload) => {
                let report = codec::decode_battery_json(payload)?;
                if report.percent.is_some() {
                    state.battery.percent = report.percent;
                }
                if report.voltage.is_some() {
                    state.battery.voltage = report.voltage;
                }
                if report.charge_status.is_some() {
                    state.battery.charge_status = report.charge_status;
                }
            }
            Payload::Binary(value) => match frame.identifier() {
                names::BATTERY_LEVEL => {
                    state.battery.percent = Some(codec::decode_ble_battery_level(value)?)
                }
                names::BATTERY_VOLTAGE => {
                    state.battery.voltage = Some(codec::decode_ble_voltage(value)?)
                }
                names::CHARGE_STATUS => {
                    state.battery.charge_status = Some(codec::decode_ble_charge_status(value)?)
                }
                other => return Err(InterpreterError::UnrecognizedCharacteristic(other.into())),
            },
        }

        self.events.emit(TrackerEvent::Battery {
            identity,
            report: state.battery.clone(),
        });
        Ok(())
    }

    fn on_settings(&mut self, identity: TrackerIdentity, frame: &Frame) -> InterpreterResult<()> {
        if identity == TrackerIdentity::Dongle {
            trace!("dongle channel control echo: {}", frame.payload_string());
            return Ok(());
        }
        let defaults = self.default_settings;
        let state = self.trackers.entry(identity).or_default();

        let settings = match frame.payload() {
            Payload::Text(payload) => {
                if state.raw_settings.as_deref() == Some(payload.as_str()) {
                    return Ok(());
                }
                let settings = codec::decode_settings(payload)?;
                state.raw_settings = Some(payload.clone());
                settings
            }
            Payload::Binary(value) => {
                let byte = codec::decode_ble_byte(value)?;
                let invalid = || {
                    InterpreterError::MalformedPacket(format!(
                        "{} value {}",
                        frame.identifier(),
                        byte
                    ))
                };
                let mut settings = state.settings.unwrap_or(defaults);
                match frame.identifier() {
                    names::FPS_SETTING => settings.fps = Fps::from_rate(byte).ok_or_else(invalid)?,
                    names::SENSOR_MODE_SETTING => {
                        settings.sensor_mode = SensorMode::from_number(byte).ok_or_else(invalid)?
                    }
                    names::AUTO_CALIBRATION_SETTING => {
                        settings.auto_correction = AutoCorrection::from_bitmask(byte)
                    }
                    _ => {
                        trace!("{} = {} not interpreted", frame.identifier(), byte);
                        return Ok(());
                    }
                }
                if state.settings == Some(settings) {
                    return Ok(());
                }
                settings
            }
        };

        state.settings = Some(settings);
        self.events
            .emit(TrackerEvent::Settings { identity, settings });
        Ok(())
    }

    fn on_info(&mut self, identity: TrackerIdentity, frame: &Frame) -> InterpreterResult<()> {
        let state = self.trackers.entry(identity).or_default();
        match frame.payload() {
            Payload::Text(payload) => {
                let info = codec::decode_device_info(payload)?;
                if info.version.is_some() {
                    state.info.version = info.version;
                }
                if info.model.is_some() {
                    state.info.model = info.model;
                }
                if info.serial.is_some() {
                    state.info.serial = info.serial;
                }
            }
            Payload::Binary(value) => {
                let text = Some(codec::decode_ble_string(value));
                match frame.identifier() {
                    names::FIRMWARE_REVISION => state.info.version = text,
                    names::MODEL_NUMBER => state.info.model = text,
                    names::SERIAL_NUMBER => state.info.serial = text,
                    names::MANUFACTURER => state.info.manufacturer = text,
                    names::HARDWARE_REVISION => state.info.hardware_revision = text,
                    names::SOFTWARE_REVISION => state.info.software_revision = text,
                    other => {
                        return Err(InterpreterError::UnrecognizedCharacteristic(other.into()))
                    }
                }
            }
        }

        self.events.emit(TrackerEvent::Info {
            identity,
            info: state.info.clone(),
        });
        Ok(())
    }

    // ---- Outbound ----

    /// Slot and transport a command for `identity` goes to.
    pub fn target(&self, identity: TrackerIdentity) -> InterpreterResult<(Binding, TransportKind)> {
        let binding = self
            .resolver
            .table()
            .binding(identity)
            .cloned()
            .ok_or(InterpreterError::NotAssigned(identity))?;
        let kind = self
            .channel_kind(&binding.channel)
            .ok_or_else(|| InterpreterError::UnknownChannel(binding.channel.clone()))?;
        Ok((binding, kind))
    }

    fn last_settings(&self, identity: TrackerIdentity) -> TrackerSettings {
        self.trackers
            .get(&identity)
            .and_then(|state| state.settings)
            .unwrap_or(self.default_settings)
    }

    /// Commands applying `settings` to one tracker.
    ///
    /// Line transports carry both trackers of a control pair in one frame,
    /// so the partner's last known settings ride along in the other slot.
    pub fn settings_commands(
        &self,
        identity: TrackerIdentity,
        settings: &TrackerSettings,
    ) -> InterpreterResult<(ChannelId, Vec<Outbound>)> {
        let (binding, kind) = self.target(identity)?;
        if !kind.is_line_protocol() {
            return Ok((binding.channel, commands::ble_settings_writes(settings)));
        }

        let partner = identity
            .settings_partner()
            .map(|partner| self.last_settings(partner))
            .unwrap_or(self.default_settings);
        let own = codec::encode_settings(settings);
        let other = codec::encode_settings(&partner);
        let lines = match binding.subport {
            SubPort::Port1 => codec::settings_lines(&other, &own),
            _ => codec::settings_lines(&own, &other),
        };
        Ok((binding.channel, vec![Outbound::Lines(lines)]))
    }

    /// One settings command per registered channel, plus the trackers each
    /// one reaches. `settings` also becomes the fallback for unknown partners.
    pub fn broadcast_commands(
        &mut self,
        settings: &TrackerSettings,
    ) -> Vec<(ChannelId, Vec<Outbound>, Vec<TrackerIdentity>)> {
        self.default_settings = *settings;
        let hex = codec::encode_settings(settings);

        self.channel_ids()
            .into_iter()
            .filter_map(|channel| {
                let kind = self.channel_kind(&channel)?;
                let outbound = if kind.is_line_protocol() {
                    vec![Outbound::Lines(codec::settings_lines(&hex, &hex))]
                } else {
                    commands::ble_settings_writes(settings)
                };
                let identities = self.resolver.table().identities_on(&channel);
                Some((channel, outbound, identities))
            })
            .collect()
    }

    /// Remember settings written to a tracker and report them.
    pub fn record_settings(&mut self, identity: TrackerIdentity, settings: TrackerSettings) {
        let state = self.trackers.entry(identity).or_default();
        state.settings = Some(settings);
        state.raw_settings = Some(codec::encode_settings(&settings));
        self.events
            .emit(TrackerEvent::Settings { identity, settings });
    }

    pub fn pairing_mut(&mut self) -> &mut PairingBook {
        &mut self.pairing
    }

    pub fn pairing(&self) -> &PairingBook {
        &self.pairing
    }

    /// Clear a slot after the unpair sequence went out.
    pub fn complete_unpair(
        &mut self,
        channel: &ChannelId,
        subport: SubPort,
    ) -> Option<TrackerIdentity> {
        let identity = self
            .resolver
            .table_mut()
            .unbind_slot(&Binding::new(channel.clone(), subport))?;
        self.mark_lost(identity);
        info!("Unpaired {} from {} port {}", identity, channel, subport);
        self.events.emit(TrackerEvent::Unpaired {
            identity,
            channel: channel.clone(),
            subport,
        });
        Some(identity)
    }

    // ---- Snapshots ----

    pub fn tracker_state(&self, identity: TrackerIdentity) -> Option<TrackerRuntimeState> {
        self.trackers.get(&identity).cloned()
    }

    pub fn active_trackers(&self) -> Vec<TrackerIdentity> {
        let mut active: Vec<TrackerIdentity> = self
            .trackers
            .iter()
            .filter(|(_, state)| state.connected)
            .map(|(identity, _)| *identity)
            .collect();
        active.sort();
        active
    }

    pub fn assignments(&self) -> Vec<(TrackerIdentity, Binding)> {
        self.resolver.table().entries()
    }

    pub fn is_resolving(&self) -> bool {
        self.resolver.is_resolving()
    }
}

//! Tracker identity resolution
//!
//! Dongle channels multiplex two trackers each and never say which tracker
//! sits where. The [`Resolver`] watches `r` acknowledgements, whose payload
//! names the tracker, and binds identities to `(channel, sub-port)` slots.
//! Frames arriving before resolution converges are held in a bounded queue
//! and replayed once the table is usable.

use crate::domain::models::{ChannelId, SubPort, TrackerIdentity};
use crate::infrastructure::protocol::codec;
use crate::infrastructure::protocol::{Frame, FrameKind};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Frames held while resolving before the queue is given up on
pub const PENDING_QUEUE_CAP: usize = 50;

/// Sub-ports per dongle channel
const PORTS_PER_CHANNEL: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Binding {
    pub channel: ChannelId,
    pub subport: SubPort,
}

impl Binding {
    pub fn new(channel: ChannelId, subport: SubPort) -> Self {
        Self { channel, subport }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Another identity holds the slot.
    SlotTaken(TrackerIdentity),
    /// The identity is already bound to a different slot.
    AlreadyBound(Binding),
}

/// Bidirectional identity ↔ slot index.
///
/// At most one identity per slot; rebinding requires an explicit unbind.
#[derive(Debug, Default)]
pub struct AssignmentTable {
    by_identity: HashMap<TrackerIdentity, Binding>,
    by_slot: HashMap<Binding, TrackerIdentity>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, identity: TrackerIdentity, binding: Binding) -> Result<(), BindError> {
        if let Some(&occupant) = self.by_slot.get(&binding) {
            if occupant == identity {
                return Ok(());
            }
            return Err(BindError::SlotTaken(occupant));
        }
        if let Some(existing) = self.by_identity.get(&identity) {
            return Err(BindError::AlreadyBound(existing.clone()));
        }
        self.by_slot.insert(binding.clone(), identity);
        self.by_identity.insert(identity, binding);
        Ok(())
    }

    pub fn unbind(&mut self, identity: TrackerIdentity) -> Option<Binding> {
        let binding = self.by_identity.remove(&identity)?;
        self.by_slot.remove(&binding);
        Some(binding)
    }

    pub fn unbind_slot(&mut self, binding: &Binding) -> Option<TrackerIdentity> {
        let identity = self.by_slot.remove(binding)?;
        self.by_identity.remove(&identity);
        Some(identity)
    }

    pub fn identity_at(&self, channel: &ChannelId, subport: SubPort) -> Option<TrackerIdentity> {
        self.by_slot
            .get(&Binding::new(channel.clone(), subport))
            .copied()
    }

    pub fn binding(&self, identity: TrackerIdentity) -> Option<&Binding> {
        self.by_identity.get(&identity)
    }

    pub fn is_bound(&self, identity: TrackerIdentity) -> bool {
        self.by_identity.contains_key(&identity)
    }

    pub fn identities_on(&self, channel: &ChannelId) -> Vec<TrackerIdentity> {
        let mut identities: Vec<TrackerIdentity> = self
            .by_identity
            .iter()
            .filter(|(_, binding)| &binding.channel == channel)
            .map(|(identity, _)| *identity)
            .collect();
        identities.sort();
        identities
    }

    /// Distinct tracker slots bound on the given channels.
    pub fn bound_slots_on(&self, channels: &HashSet<ChannelId>) -> usize {
        self.by_slot
            .keys()
            .filter(|binding| {
                binding.subport.is_tracker_port() && channels.contains(&binding.channel)
            })
            .count()
    }

    pub fn entries(&self) -> Vec<(TrackerIdentity, Binding)> {
        let mut entries: Vec<(TrackerIdentity, Binding)> = self
            .by_identity
            .iter()
            .map(|(identity, binding)| (*identity, binding.clone()))
            .collect();
        entries.sort_by_key(|(identity, _)| *identity);
        entries
    }
}

/// A frame held back while resolution is incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFrame {
    pub channel: ChannelId,
    pub frame: Frame,
}

/// What the caller should do with a frame after admission.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Resolution is complete; process the frame now.
    Dispatch(Frame),
    Queued,
    /// Orientation frames are not held while resolving.
    Dropped,
    /// Resolution converged with this frame; process these in order.
    Replay(Vec<PendingFrame>),
    /// The queue hit its cap and was discarded.
    Abandoned { discarded: usize },
}

#[derive(Debug)]
pub struct Resolver {
    table: AssignmentTable,
    required: Vec<TrackerIdentity>,
    multiplexed: HashSet<ChannelId>,
    pending: VecDeque<PendingFrame>,
    complete: bool,
}

impl Resolver {
    pub fn new(required: Vec<TrackerIdentity>) -> Self {
        Self {
            table: AssignmentTable::new(),
            required,
            multiplexed: HashSet::new(),
            pending: VecDeque::with_capacity(PENDING_QUEUE_CAP),
            complete: false,
        }
    }

    pub fn table(&self) -> &AssignmentTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut AssignmentTable {
        &mut self.table
    }

    /// Multiplexed channels taking part in resolution. Slots on other
    /// channels, such as pinned single-tracker links, never count towards
    /// convergence.
    pub fn set_multiplexed(&mut self, channels: impl IntoIterator<Item = ChannelId>) {
        self.multiplexed = channels.into_iter().collect();
    }

    /// Start a fresh resolution round. Bindings survive.
    pub fn restart(&mut self) {
        self.pending.clear();
        self.complete = false;
    }

    pub fn is_resolving(&self) -> bool {
        !self.complete
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bind the identity announced by an `r` frame to its slot.
    ///
    /// Works after completion too, so trackers that join late still get a
    /// slot. Returns the identity when a new binding was made.
    pub fn observe(&mut self, channel: &ChannelId, frame: &Frame) -> Option<TrackerIdentity> {
        if frame.kind() != FrameKind::Button || frame.is_gatt() {
            return None;
        }
        let subport = frame.subport().filter(|port| port.is_tracker_port())?;
        let payload = frame.text()?;
        let identity = codec::ack_tracker_id(payload).and_then(TrackerIdentity::from_protocol_id)?;
        if identity == TrackerIdentity::Dongle || self.table.is_bound(identity) {
            return None;
        }

        match self
            .table
            .bind(identity, Binding::new(channel.clone(), subport))
        {
            Ok(()) => {
                info!("Assigned {} to {} port {}", identity, channel, subport);
                Some(identity)
            }
            Err(conflict) => {
                debug!("{} not assigned to {}/{}: {:?}", identity, channel, subport, conflict);
                None
            }
        }
    }

    fn converged(&self) -> bool {
        let all_required = self
            .required
            .iter()
            .all(|identity| self.table.is_bound(*identity));
        let slots_full = !self.multiplexed.is_empty()
            && self.table.bound_slots_on(&self.multiplexed)
                >= self.multiplexed.len() * PORTS_PER_CHANNEL;
        all_required || slots_full
    }

    pub fn admit(&mut self, channel: &ChannelId, frame: Frame) -> Admission {
        if self.complete {
            return Admission::Dispatch(frame);
        }
        if frame.kind() == FrameKind::Orientation {
            return Admission::Dropped;
        }

        self.pending.push_back(PendingFrame {
            channel: channel.clone(),
            frame,
        });

        if self.converged() {
            self.complete = true;
            info!(
                "Tracker assignment complete, replaying {} queued frames",
                self.pending.len()
            );
            return Admission::Replay(self.pending.drain(..).collect());
        }

        if self.pending.len() >= PENDING_QUEUE_CAP {
            self.complete = true;
            let discarded = self.pending.len();
            self.pending.clear();
            warn!(
                "Tracker assignment incomplete after {} frames; continuing best-effort",
                discarded
            );
            return Admission::Abandoned { discarded };
        }

        Admission::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocol::frame::parse_line;

    fn ack(subport: u8, id: u8) -> Frame {
        parse_line(&format!("r{}:1100{}0800", subport, id)).unwrap()
    }

    #[test]
    fn test_table_is_bidirectional_and_exclusive() {
        let mut table = AssignmentTable::new();
        let slot = Binding::new(ChannelId::from("COM3"), SubPort::Port0);
        table.bind(TrackerIdentity::Hip, slot.clone()).unwrap();

        assert_eq!(
            table.bind(TrackerIdentity::Chest, slot.clone()),
            Err(BindError::SlotTaken(TrackerIdentity::Hip))
        );
        assert_eq!(
            table.identity_at(&ChannelId::from("COM3"), SubPort::Port0),
            Some(TrackerIdentity::Hip)
        );
        assert_eq!(table.unbind_slot(&slot), Some(TrackerIdentity::Hip));
        assert!(!table.is_bound(TrackerIdentity::Hip));
        table.bind(TrackerIdentity::Chest, slot).unwrap();
    }

    #[test]
    fn test_converges_over_three_channels_and_replays_in_order() {
        let mut resolver = Resolver::new(TrackerIdentity::LOWER_BODY.to_vec());
        let channels = ["COM3", "COM4", "COM5"].map(ChannelId::from);
        resolver.set_multiplexed(channels.clone());
        let ids = [6u8, 1, 2, 3, 4, 5];

        let mut admitted = Vec::new();
        let mut replayed = None;
        for (index, id) in ids.iter().enumerate() {
            let channel = &channels[index / 2];
            // An orientation frame in between is never queued
            let noise = parse_line("x0:AAAA").unwrap();
            assert_eq!(resolver.admit(channel, noise), Admission::Dropped);

            let frame = ack((index % 2) as u8, *id);
            resolver.observe(channel, &frame);
            admitted.push(PendingFrame {
                channel: channel.clone(),
                frame: frame.clone(),
            });
            match resolver.admit(channel, frame) {
                Admission::Queued => {}
                Admission::Replay(frames) => replayed = Some(frames),
                other => panic!("unexpected admission {:?}", other),
            }
        }

        assert_eq!(replayed, Some(admitted));
        assert!(!resolver.is_resolving());
        assert_eq!(
            resolver.table().identity_at(&channels[2], SubPort::Port1),
            Some(TrackerIdentity::RightAnkle)
        );
        let late = parse_line("v0:{}").unwrap();
        assert!(matches!(
            resolver.admit(&channels[0], late),
            Admission::Dispatch(_)
        ));
    }

    #[test]
    fn test_slot_count_converges_without_required_set() {
        let mut resolver = Resolver::new(TrackerIdentity::LOWER_BODY.to_vec());
        let channel = ChannelId::from("COM3");
        resolver.set_multiplexed([channel.clone()]);

        for (port, id) in [(0, 7u8), (1, 8)] {
            let frame = ack(port, id);
            resolver.observe(&channel, &frame);
            let admission = resolver.admit(&channel, frame);
            if port == 1 {
                assert!(matches!(admission, Admission::Replay(ref frames) if frames.len() == 2));
            }
        }
    }

    #[test]
    fn test_pinned_slots_do_not_fill_dongle_slots() {
        let mut resolver = Resolver::new(TrackerIdentity::LOWER_BODY.to_vec());
        let dongle = ChannelId::from("COM3");
        resolver.set_multiplexed([dongle.clone()]);
        for (port, identity) in [("COM7", TrackerIdentity::Hip), ("COM8", TrackerIdentity::Chest)] {
            resolver
                .table_mut()
                .bind(identity, Binding::new(ChannelId::from(port), SubPort::Port0))
                .unwrap();
        }

        let battery = parse_line(r#"v0:{"battery remaining": 42}"#).unwrap();
        assert_eq!(resolver.admit(&dongle, battery), Admission::Queued);
        let frame = ack(0, 2);
        resolver.observe(&dongle, &frame);
        assert_eq!(resolver.admit(&dongle, frame), Admission::Queued);
        assert!(resolver.is_resolving());

        let frame = ack(1, 3);
        resolver.observe(&dongle, &frame);
        assert!(matches!(
            resolver.admit(&dongle, frame),
            Admission::Replay(ref frames) if frames.len() == 3
        ));
    }

    #[test]
    fn test_queue_cap_discards_without_replay() {
        let mut resolver = Resolver::new(TrackerIdentity::LOWER_BODY.to_vec());
        let channel = ChannelId::from("COM3");
        resolver.set_multiplexed(["COM3", "COM4", "COM5"].map(ChannelId::from));

        for _ in 0..PENDING_QUEUE_CAP - 1 {
            let frame = parse_line("a0:0102").unwrap();
            assert_eq!(resolver.admit(&channel, frame), Admission::Queued);
        }
        let frame = parse_line("a0:0102").unwrap();
        assert_eq!(
            resolver.admit(&channel, frame),
            Admission::Abandoned {
                discarded: PENDING_QUEUE_CAP
            }
        );
        assert_eq!(resolver.pending_len(), 0);
        assert!(!resolver.is_resolving());
    }

    #[test]
    fn test_late_tracker_binds_after_completion() {
        let mut resolver = Resolver::new(Vec::new());
        let channel = ChannelId::from("COM3");
        let first = parse_line("i:{}").unwrap();
        assert!(matches!(resolver.admit(&channel, first), Admission::Replay(_)));

        assert_eq!(
            resolver.observe(&channel, &ack(1, 7)),
            Some(TrackerIdentity::RightElbow)
        );
        assert_eq!(resolver.observe(&channel, &ack(0, 7)), None);
    }
}

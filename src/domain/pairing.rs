//! Pairing state machine
//!
//! One [`PairingSession`] per channel. The command sequence itself is driven
//! by the facade; this module only tracks where each channel is and hands
//! the acknowledged identity back through a oneshot.

use crate::domain::error::{InterpreterError, InterpreterResult};
use crate::domain::models::{ChannelId, SubPort, TrackerIdentity};
use crate::infrastructure::protocol::codec;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    /// Command sequence in flight.
    Pairing,
    AwaitingAck,
}

#[derive(Debug)]
pub struct PairingSession {
    pub channel: ChannelId,
    pub subport: SubPort,
    phase: PairingPhase,
    completion: Option<oneshot::Sender<TrackerIdentity>>,
}

impl PairingSession {
    pub fn phase(&self) -> PairingPhase {
        self.phase
    }
}

/// Acknowledgement matched to a pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingAck {
    pub identity: TrackerIdentity,
    pub channel: ChannelId,
    pub subport: SubPort,
}

#[derive(Debug, Default)]
pub struct PairingBook {
    sessions: HashMap<ChannelId, PairingSession>,
}

impl PairingBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session; fails if the channel already has one.
    pub fn begin(
        &mut self,
        channel: &ChannelId,
        subport: SubPort,
    ) -> InterpreterResult<oneshot::Receiver<TrackerIdentity>> {
        if self.sessions.contains_key(channel) {
            return Err(InterpreterError::PairingInProgress(channel.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.sessions.insert(
            channel.clone(),
            PairingSession {
                channel: channel.clone(),
                subport,
                phase: PairingPhase::Pairing,
                completion: Some(tx),
            },
        );
        Ok(rx)
    }

    /// Command sequence sent; start accepting acknowledgements.
    pub fn await_ack(&mut self, channel: &ChannelId) -> bool {
        match self.sessions.get_mut(channel) {
            Some(session) if session.phase == PairingPhase::Pairing => {
                session.phase = PairingPhase::AwaitingAck;
                true
            }
            _ => false,
        }
    }

    /// Match an `r` payload against the channel's session.
    ///
    /// On a match the session ends and the waiting pairer is woken.
    pub fn observe_ack(
        &mut self,
        channel: &ChannelId,
        subport: SubPort,
        payload: &str,
    ) -> Option<PairingAck> {
        let session = self.sessions.get(channel)?;
        if session.phase != PairingPhase::AwaitingAck
            || session.subport != subport
            || !codec::is_pairing_ack(payload)
        {
            return None;
        }
        let identity = codec::ack_tracker_id(payload)
            .and_then(TrackerIdentity::from_protocol_id)
            .filter(|identity| *identity != TrackerIdentity::Dongle)?;

        let mut session = self.sessions.remove(channel)?;
        if let Some(completion) = session.completion.take() {
            let _ = completion.send(identity);
        }
        debug!("Pairing acknowledged by {} on {}", identity, channel);
        Some(PairingAck {
            identity,
            channel: session.channel,
            subport: session.subport,
        })
    }

    /// Drop the channel's session; a waiting pairer sees its receiver close.
    pub fn abandon(&mut self, channel: &ChannelId) -> bool {
        self.sessions.remove(channel).is_some()
    }

    pub fn phase(&self, channel: &ChannelId) -> PairingPhase {
        self.sessions
            .get(channel)
            .map(PairingSession::phase)
            .unwrap_or(PairingPhase::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_begin_is_rejected() {
        let mut book = PairingBook::new();
        let channel = ChannelId::from("COM3");
        let _rx = book.begin(&channel, SubPort::Port0).unwrap();
        assert_eq!(book.phase(&channel), PairingPhase::Pairing);
        assert!(matches!(
            book.begin(&channel, SubPort::Port1),
            Err(InterpreterError::PairingInProgress(_))
        ));
        // Other channels are independent
        assert!(book.begin(&ChannelId::from("COM4"), SubPort::Port0).is_ok());
    }

    #[test]
    fn test_ack_only_accepted_while_awaiting() {
        let mut book = PairingBook::new();
        let channel = ChannelId::from("COM3");
        let mut rx = book.begin(&channel, SubPort::Port1).unwrap();

        assert_eq!(book.observe_ack(&channel, SubPort::Port1, "113040800"), None);
        assert!(book.await_ack(&channel));
        assert_eq!(book.observe_ack(&channel, SubPort::Port0, "113040800"), None);
        assert_eq!(book.observe_ack(&channel, SubPort::Port1, "110040800"), None);

        let ack = book
            .observe_ack(&channel, SubPort::Port1, "113040800")
            .unwrap();
        assert_eq!(ack.identity, TrackerIdentity::RightKnee);
        assert_eq!(rx.try_recv().unwrap(), TrackerIdentity::RightKnee);
        assert_eq!(book.phase(&channel), PairingPhase::Idle);
        assert_eq!(book.observe_ack(&channel, SubPort::Port1, "113040800"), None);
    }

    #[test]
    fn test_abandon_closes_receiver() {
        let mut book = PairingBook::new();
        let channel = ChannelId::from("COM3");
        let mut rx = book.begin(&channel, SubPort::Port0).unwrap();
        assert!(book.abandon(&channel));
        assert!(rx.try_recv().is_err());
        assert!(!book.abandon(&channel));
    }
}

//! Peer session state machine
//!
//! A session moves `Joining → Negotiating → Active → Leaving`. Leaving is
//! terminal: once entered, every resource set is drained exactly once and
//! any later request against the session fails with
//! [`Error::SessionClosed`], which the signaling layer swallows.
//!
//! The resource sets live behind a `parking_lot::Mutex`. Callers lock it for
//! short, synchronous sections only and never hold it across an engine call.

use crate::error::{Error, Result};
use crate::negotiator::DeviceCapabilitySet;
use crate::sender::MessageSender;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;
use sfumeet_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, PeerId, ProducerId, ProducerInfo, RoomId,
    ServerEnvelope, TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Joining,
    Negotiating,
    Active,
    Leaving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Joining => "joining",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub connected: bool,
    /// Parameters of the first successful connect
    pub dtls_parameters: Option<Value>,
}

impl TransportRecord {
    #[must_use]
    pub const fn new(id: TransportId, direction: TransportDirection) -> Self {
        Self {
            id,
            direction,
            connected: false,
            dtls_parameters: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub kind: MediaKind,
}

/// Everything a leaving session still owned at the engine
#[derive(Debug, Default)]
pub struct SessionResources {
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

impl SessionResources {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

/// Mutable part of a session, guarded by the session lock
#[derive(Debug)]
pub struct SessionInner {
    pub state: SessionState,
    pub device: Option<DeviceCapabilitySet>,
    pub send_transport: Option<TransportRecord>,
    pub recv_transport: Option<TransportRecord>,
    /// At most one producer per kind
    pub producers: HashMap<MediaKind, ProducerRecord>,
    /// Keyed by the consumed producer
    pub consumers: HashMap<ProducerId, ConsumerDescriptor>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Joining,
            device: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Leaving {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub const fn transport(&self, direction: TransportDirection) -> Option<&TransportRecord> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    pub fn transport_mut(&mut self, direction: TransportDirection) -> &mut Option<TransportRecord> {
        match direction {
            TransportDirection::Send => &mut self.send_transport,
            TransportDirection::Recv => &mut self.recv_transport,
        }
    }

    /// Direction of the session's transport with this id, if any
    #[must_use]
    pub fn direction_of(&self, transport_id: &TransportId) -> Option<TransportDirection> {
        [TransportDirection::Send, TransportDirection::Recv]
            .into_iter()
            .find(|d| self.transport(*d).is_some_and(|t| &t.id == transport_id))
    }

    #[must_use]
    pub fn both_connected(&self) -> bool {
        self.send_transport.as_ref().is_some_and(|t| t.connected)
            && self.recv_transport.as_ref().is_some_and(|t| t.connected)
    }

    /// Require both transports to exist and be connected
    pub fn ensure_transports_ready(&self) -> Result<()> {
        if self.send_transport.is_none() || self.recv_transport.is_none() {
            return Err(Error::precondition("send and receive transports must be created first"));
        }
        if !self.both_connected() {
            return Err(Error::precondition("send and receive transports must be connected first"));
        }
        Ok(())
    }

    /// `Negotiating → Active` once both transports are connected.
    /// Returns whether the transition happened.
    pub fn activate(&mut self) -> bool {
        if self.state == SessionState::Negotiating && self.both_connected() {
            self.state = SessionState::Active;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn producer_infos(&self, peer_id: &PeerId) -> Vec<ProducerInfo> {
        self.producers
            .values()
            .map(|p| ProducerInfo {
                producer_id: p.id.clone(),
                kind: p.kind,
                peer_id: peer_id.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn owns_producer(&self, producer_id: &ProducerId) -> Option<MediaKind> {
        self.producers
            .values()
            .find(|p| &p.id == producer_id)
            .map(|p| p.kind)
    }

    fn drain(&mut self) -> SessionResources {
        SessionResources {
            transports: [self.send_transport.take(), self.recv_transport.take()]
                .into_iter()
                .flatten()
                .map(|t| t.id)
                .collect(),
            producers: self.producers.drain().map(|(_, p)| p.id).collect(),
            consumers: self.consumers.drain().map(|(_, c)| c.consumer_id).collect(),
        }
    }
}

/// Point-in-time counters of one session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounts {
    pub audio_producers: usize,
    pub video_producers: usize,
    pub consumers: usize,
}

/// One peer connected to one room
pub struct PeerSession {
    id: PeerId,
    room_id: RoomId,
    joined_at: DateTime<Utc>,
    sender: Arc<dyn MessageSender>,
    inner: Mutex<SessionInner>,
}

impl PeerSession {
    pub fn new(id: PeerId, room_id: RoomId, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            id,
            room_id,
            joined_at: Utc::now(),
            sender,
            inner: Mutex::new(SessionInner::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub const fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.state() == SessionState::Leaving
    }

    /// Lock the resource sets. The guard must be dropped before any `.await`.
    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }

    /// `Joining → Negotiating`, taken once the session is registered in its room
    pub fn start_negotiating(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Joining {
            inner.state = SessionState::Negotiating;
            debug!(peer_id = %self.id, room_id = %self.room_id, "Session negotiating");
        }
    }

    /// Enter `Leaving` and hand back every owned resource.
    /// Returns `None` if the session was already leaving.
    pub fn begin_leave(&self) -> Option<SessionResources> {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Leaving {
            return None;
        }
        let previous = inner.state;
        inner.state = SessionState::Leaving;
        let resources = inner.drain();
        info!(
            peer_id = %self.id,
            room_id = %self.room_id,
            from = %previous,
            transports = resources.transports.len(),
            producers = resources.producers.len(),
            consumers = resources.consumers.len(),
            "Session leaving"
        );
        Some(resources)
    }

    #[must_use]
    pub fn counts(&self) -> SessionCounts {
        let inner = self.inner.lock();
        SessionCounts {
            audio_producers: usize::from(inner.producers.contains_key(&MediaKind::Audio)),
            video_producers: usize::from(inner.producers.contains_key(&MediaKind::Video)),
            consumers: inner.consumers.len(),
        }
    }

    /// Deliver a message to this peer. Failures are logged and reported
    /// as `false`; they never propagate.
    pub fn notify(&self, message: ServerEnvelope) -> bool {
        let name = message.message.name();
        match self.sender.send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer_id = %self.id, message = name, error = %e, "Failed to deliver message");
                false
            }
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfumeet_proto::ServerMessage;
    use tokio::sync::mpsc;

    fn session() -> (PeerSession, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::new(PeerId::from("p1"), RoomId::from("R1"), Arc::new(tx));
        (session, rx)
    }

    fn connected(direction: TransportDirection) -> TransportRecord {
        let mut record = TransportRecord::new(TransportId::generate(), direction);
        record.connected = true;
        record
    }

    #[test]
    fn test_activation_requires_both_transports() {
        let (session, _rx) = session();
        assert_eq!(session.state(), SessionState::Joining);
        session.start_negotiating();

        let mut inner = session.lock();
        assert!(!inner.activate());
        inner.send_transport = Some(connected(TransportDirection::Send));
        assert!(!inner.activate());
        assert!(inner.ensure_transports_ready().is_err());

        inner.recv_transport = Some(TransportRecord::new(
            TransportId::generate(),
            TransportDirection::Recv,
        ));
        assert!(inner.ensure_transports_ready().is_err());
        inner.recv_transport = Some(connected(TransportDirection::Recv));
        assert!(inner.activate());
        assert_eq!(inner.state, SessionState::Active);
        assert!(!inner.activate());
    }

    #[test]
    fn test_begin_leave_drains_once() {
        let (session, _rx) = session();
        session.start_negotiating();
        {
            let mut inner = session.lock();
            inner.send_transport = Some(connected(TransportDirection::Send));
            inner.producers.insert(
                MediaKind::Video,
                ProducerRecord {
                    id: ProducerId::from("v"),
                    kind: MediaKind::Video,
                },
            );
        }

        let resources = session.begin_leave().unwrap();
        assert_eq!(resources.transports.len(), 1);
        assert_eq!(resources.producers, vec![ProducerId::from("v")]);
        assert!(session.is_leaving());
        assert!(session.begin_leave().is_none());
        assert!(matches!(session.lock().ensure_open(), Err(Error::SessionClosed)));
    }

    #[test]
    fn test_direction_lookup() {
        let (session, _rx) = session();
        let mut inner = session.lock();
        let send = connected(TransportDirection::Send);
        let id = send.id.clone();
        inner.send_transport = Some(send);
        assert_eq!(inner.direction_of(&id), Some(TransportDirection::Send));
        assert_eq!(inner.direction_of(&TransportId::from("other")), None);
    }

    #[test]
    fn test_notify_reports_closed_channel() {
        let (session, rx) = session();
        let message = || {
            ServerEnvelope::push(ServerMessage::PeerDisconnected {
                peer_id: PeerId::from("p2"),
            })
        };
        assert!(session.notify(message()));
        drop(rx);
        assert!(!session.notify(message()));
    }
}

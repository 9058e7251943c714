//! Room directory - top-level orchestration for every room of the process
//!
//! This module provides:
//! - Room creation on first join and removal once the last peer leaves
//! - Room and peer limit enforcement
//! - Per-peer request entry points, resolved to the peer's session
//! - Leave handling with resource release and `peer-disconnected` fan-out
//! - Global statistics collection
//! - Engine death detection

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::negotiator::CapabilityNegotiator;
use crate::registry::Registry;
use crate::room::{Room, RoomStats};
use crate::sender::MessageSender;
use crate::session::PeerSession;
use crate::transport::TransportManager;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sfumeet_proto::{
    ConsumerDescriptor, MediaKind, PeerId, ProducerId, ProducerInfo, RoomId, RtpCapabilities,
    RtpParameters, ServerMessage, TransportDescriptor, TransportDirection, TransportId,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Global directory statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryStats {
    /// Number of live rooms
    pub rooms: usize,
    /// Peers across all rooms, in any state
    pub peers: usize,
    /// Peers in the active state
    pub active_peers: usize,
    pub producers: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub consumers: usize,
}

/// Room directory - owns every room and, through them, every peer session
pub struct RoomDirectory {
    config: SfuConfig,
    engine: Arc<dyn MediaEngine>,
    negotiator: Arc<CapabilityNegotiator>,
    transports: TransportManager,
    registry: Registry,

    /// Live rooms (`DashMap` for lock-free lookups across connections)
    rooms: DashMap<RoomId, Arc<Room>>,

    /// Held while a room is created so the `max_rooms` check and the insert
    /// happen as one step
    room_creation: Mutex<()>,

    /// Cancelled once the engine died or the process is shutting down
    shutdown: CancellationToken,
}

impl RoomDirectory {
    pub fn new(engine: Arc<dyn MediaEngine>, config: SfuConfig) -> Arc<Self> {
        let negotiator = Arc::new(CapabilityNegotiator::new(engine.rtp_capabilities()));
        info!(
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            router_codecs = negotiator.router_capabilities().codecs.len(),
            "Room directory initialized"
        );
        Arc::new(Self {
            transports: TransportManager::new(Arc::clone(&engine)),
            registry: Registry::new(Arc::clone(&engine), Arc::clone(&negotiator)),
            config,
            engine,
            negotiator,
            rooms: DashMap::new(),
            room_creation: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    #[must_use]
    pub fn is_engine_alive(&self) -> bool {
        self.engine.is_alive()
    }

    #[must_use]
    pub const fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Refuse new work once the engine is gone
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() || !self.engine.is_alive() {
            return Err(Error::EngineFatal(
                "media engine is not available".to_string(),
            ));
        }
        Ok(())
    }

    /// Get or create a room
    fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        let existing = self.rooms.get(room_id).map(|r| Arc::clone(r.value()));
        if let Some(room) = existing.filter(|r| !r.is_closed()) {
            return Ok(room);
        }

        let _creating = self.room_creation.lock();

        // Enforce room limit (0 = unlimited)
        if self.config.max_rooms > 0
            && !self.rooms.contains_key(room_id)
            && self.rooms.len() >= self.config.max_rooms
        {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(Error::CapacityExceeded(
                "maximum number of rooms reached".to_string(),
            ));
        }

        let room = match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_closed() {
                    let room = Arc::new(Room::new(room_id.clone()));
                    entry.insert(Arc::clone(&room));
                    room
                } else {
                    Arc::clone(entry.get())
                }
            }
            Entry::Vacant(entry) => {
                let room = Arc::new(Room::new(room_id.clone()));
                entry.insert(Arc::clone(&room));
                info!(room_id = %room_id, "Created new room");
                room
            }
        };
        Ok(room)
    }

    /// Register a new peer session in `room_id`, creating the room on first use
    pub async fn join(
        &self,
        room_id: RoomId,
        peer_id: PeerId,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Arc<PeerSession>> {
        self.ensure_running()?;
        loop {
            let room = self.get_or_create_room(&room_id)?;
            let mut peers = room.write().await;
            if room.is_closed() {
                // Emptied and dropped while we waited for the lock
                continue;
            }
            if peers.contains_key(&peer_id) {
                return Err(Error::precondition("peer already joined this room"));
            }

            // Check peer limit (0 = unlimited)
            if self.config.max_peers_per_room > 0 && peers.len() >= self.config.max_peers_per_room {
                warn!(
                    room_id = %room_id,
                    current_peers = peers.len(),
                    max_peers = self.config.max_peers_per_room,
                    "Peer limit reached for room"
                );
                return Err(Error::CapacityExceeded(
                    "maximum number of peers reached for this room".to_string(),
                ));
            }

            let session = Arc::new(PeerSession::new(
                peer_id.clone(),
                room_id.clone(),
                Arc::clone(&sender),
            ));
            session.start_negotiating();
            peers.insert(peer_id.clone(), Arc::clone(&session));
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                peer_count = peers.len(),
                "Peer joined room"
            );
            return Ok(session);
        }
    }

    /// Room and session of a joined peer. A peer that already left
    /// resolves to `SessionClosed`.
    async fn resolve(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<(Arc<Room>, Arc<PeerSession>)> {
        let room = self.room(room_id).ok_or(Error::SessionClosed)?;
        let session = room.session(peer_id).await.ok_or(Error::SessionClosed)?;
        Ok((room, session))
    }

    /// Router capabilities; computes the session's device capability set
    /// on the first call
    pub async fn router_capabilities(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
    ) -> Result<RtpCapabilities> {
        self.ensure_running()?;
        let (_, session) = self.resolve(room_id, peer_id).await?;
        let mut inner = session.lock();
        inner.ensure_open()?;
        if inner.device.is_none() {
            inner.device = Some(self.negotiator.device_for_router());
            debug!(peer_id = %peer_id, "Device capability set computed");
        }
        Ok(self.negotiator.router_capabilities().clone())
    }

    pub async fn create_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        self.ensure_running()?;
        let (room, session) = self.resolve(room_id, peer_id).await?;
        self.transports
            .create_transport(&room, &session, direction)
            .await
    }

    pub async fn connect_transport(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<()> {
        self.ensure_running()?;
        let (_, session) = self.resolve(room_id, peer_id).await?;
        self.transports
            .connect_transport(&session, transport_id, dtls_parameters)
            .await
    }

    pub async fn produce(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        self.ensure_running()?;
        let (room, session) = self.resolve(room_id, peer_id).await?;
        self.registry
            .produce(&room, &session, transport_id, kind, rtp_parameters)
            .await
    }

    pub async fn get_producers(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
    ) -> Result<Vec<ProducerInfo>> {
        self.ensure_running()?;
        let (room, session) = self.resolve(room_id, peer_id).await?;
        self.registry.list_producers(&room, &session).await
    }

    pub async fn consume(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        self.ensure_running()?;
        let (room, session) = self.resolve(room_id, peer_id).await?;
        self.registry
            .consume(&room, &session, producer_id, rtp_capabilities)
            .await
    }

    /// Remove a peer from its room, closing everything it owned.
    ///
    /// Idempotent: returns `false` if the peer was not (or no longer) a
    /// member of the room.
    pub async fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };

        let (resources, emptied) = {
            let mut peers = room.write().await;
            let Some(session) = peers.get(peer_id).cloned() else {
                return false;
            };
            let Some(resources) = session.begin_leave() else {
                return false;
            };
            peers.remove(peer_id);
            let emptied = peers.is_empty() && self.config.drop_empty_rooms;
            if emptied {
                room.mark_closed();
            }
            (resources, emptied)
        };

        // peer-disconnected tells the others about these producers
        let dropped = room
            .retire_producers(peer_id, &resources.producers, false)
            .await;
        for consumer_id in &dropped {
            self.engine.close_consumer(consumer_id).await;
        }
        self.transports.release(&resources).await;

        let notified = room
            .broadcast(
                Some(peer_id),
                &ServerMessage::PeerDisconnected {
                    peer_id: peer_id.clone(),
                },
            )
            .await;

        if emptied {
            self.rooms.remove_if(room_id, |_, r| Arc::ptr_eq(r, &room));
            info!(room_id = %room_id, "Removed empty room");
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            producers_closed = resources.producers.len(),
            consumers_closed = resources.consumers.len(),
            notified,
            "Peer left room"
        );
        true
    }

    /// Deliver a message to every active member of a room except `excluding`
    pub async fn broadcast(
        &self,
        room_id: &RoomId,
        excluding: Option<&PeerId>,
        message: &ServerMessage,
    ) -> usize {
        match self.room(room_id) {
            Some(room) => room.broadcast(excluding, message).await,
            None => 0,
        }
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn room_list(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Per-room statistics, sorted by room id
    pub async fn room_stats(&self) -> Vec<RoomStats> {
        let mut stats = Vec::new();
        for room in self.room_list() {
            stats.push(room.stats().await);
        }
        stats.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        stats
    }

    pub async fn stats(&self) -> DirectoryStats {
        let mut stats = DirectoryStats::default();
        for room in self.room_stats().await {
            stats.rooms += 1;
            stats.peers += room.peers;
            stats.active_peers += room.active_peers;
            stats.producers += room.producers();
            stats.audio_producers += room.audio_producers;
            stats.video_producers += room.video_producers;
            stats.consumers += room.consumers;
        }
        stats
    }

    /// Stop accepting new work. Leaves still go through.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            warn!("Room directory shutting down");
            self.shutdown.cancel();
        }
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the directory has been shut down
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }

    /// Wait for the engine worker to die, then shut the directory down
    pub async fn run_engine_watchdog(&self) {
        tokio::select! {
            () = self.engine.died() => {
                error!("Media engine worker died, refusing new work");
                self.shutdown();
            }
            () = self.shutdown.cancelled() => {}
        }
    }

    /// Make every peer of every room leave
    pub async fn close_all(&self) {
        for room in self.room_list() {
            let peer_ids: Vec<PeerId> = room.read().await.keys().cloned().collect();
            for peer_id in peer_ids {
                self.leave(room.id(), &peer_id).await;
            }
        }
        info!("All rooms closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use crate::session::SessionState;
    use sfumeet_proto::ServerEnvelope;
    use tokio::sync::mpsc;

    fn directory(config: SfuConfig) -> (Arc<LocalEngine>, Arc<RoomDirectory>) {
        let engine = Arc::new(LocalEngine::default());
        let directory = RoomDirectory::new(engine.clone(), config);
        (engine, directory)
    }

    async fn join(
        directory: &RoomDirectory,
        room: &str,
        peer: &str,
    ) -> Result<mpsc::UnboundedReceiver<ServerEnvelope>> {
        let (tx, rx) = mpsc::unbounded_channel();
        directory
            .join(RoomId::from(room), PeerId::from(peer), Arc::new(tx))
            .await?;
        Ok(rx)
    }

    #[tokio::test]
    async fn test_join_creates_room_and_negotiates() {
        let (_engine, directory) = directory(SfuConfig::default());
        let _rx = join(&directory, "R1", "p1").await.unwrap();
        let room = directory.room(&RoomId::from("R1")).unwrap();
        let session = room.session(&PeerId::from("p1")).await.unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(directory.room_count(), 1);

        let again = join(&directory, "R1", "p1").await.unwrap_err();
        assert!(matches!(again, Error::PreconditionNotMet(_)));
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let config = SfuConfig {
            max_peers_per_room: 1,
            ..SfuConfig::default()
        };
        let (_engine, directory) = directory(config);
        let _rx = join(&directory, "R1", "p1").await.unwrap();
        let err = join(&directory, "R1", "p2").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        let _other = join(&directory, "R2", "p2").await.unwrap();
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = SfuConfig {
            max_rooms: 1,
            ..SfuConfig::default()
        };
        let (_engine, directory) = directory(config);
        let _rx = join(&directory, "R1", "p1").await.unwrap();
        let err = join(&directory, "R2", "p2").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        let _same = join(&directory, "R1", "p2").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_room_limit_holds_under_concurrent_creation() {
        let config = SfuConfig {
            max_rooms: 1,
            ..SfuConfig::default()
        };
        let (_engine, directory) = directory(config);

        let joins = (0..16)
            .map(|i| {
                let directory = Arc::clone(&directory);
                tokio::spawn(async move {
                    join(&directory, &format!("R{i}"), &format!("p{i}")).await
                })
            })
            .collect::<Vec<_>>();
        let mut receivers = Vec::new();
        for handle in joins {
            match handle.await.unwrap() {
                Ok(rx) => receivers.push(rx),
                Err(e) => assert!(matches!(e, Error::CapacityExceeded(_))),
            }
        }

        assert_eq!(receivers.len(), 1);
        assert_eq!(directory.room_count(), 1);
    }

    #[tokio::test]
    async fn test_leave_drops_empty_room_and_is_idempotent() {
        let (_engine, directory) = directory(SfuConfig::default());
        let _rx = join(&directory, "R1", "p1").await.unwrap();
        let room_id = RoomId::from("R1");
        let peer_id = PeerId::from("p1");

        assert!(directory.leave(&room_id, &peer_id).await);
        assert!(!directory.leave(&room_id, &peer_id).await);
        assert_eq!(directory.room_count(), 0);

        let err = directory
            .router_capabilities(&room_id, &peer_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }

    #[tokio::test]
    async fn test_keep_empty_rooms_when_configured() {
        let config = SfuConfig {
            drop_empty_rooms: false,
            ..SfuConfig::default()
        };
        let (_engine, directory) = directory(config);
        let _rx = join(&directory, "R1", "p1").await.unwrap();
        directory.leave(&RoomId::from("R1"), &PeerId::from("p1")).await;
        assert_eq!(directory.room_count(), 1);
        let _rx = join(&directory, "R1", "p2").await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_death_refuses_work() {
        let (engine, directory) = directory(SfuConfig::default());
        let _rx = join(&directory, "R1", "p1").await.unwrap();

        let watchdog = {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move { directory.run_engine_watchdog().await })
        };
        engine.kill();
        watchdog.await.unwrap();
        assert!(directory.is_shutdown());

        let err = join(&directory, "R1", "p2").await.unwrap_err();
        assert!(matches!(err, Error::EngineFatal(_)));
        assert!(directory.leave(&RoomId::from("R1"), &PeerId::from("p1")).await);
    }

    #[tokio::test]
    async fn test_stats_count_peers() {
        let (_engine, directory) = directory(SfuConfig::default());
        let _a = join(&directory, "R1", "a").await.unwrap();
        let _b = join(&directory, "R1", "b").await.unwrap();
        let _c = join(&directory, "R2", "c").await.unwrap();
        let stats = directory.stats().await;
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.peers, 3);
        assert_eq!(stats.active_peers, 0);

        directory.close_all().await;
        assert_eq!(directory.stats().await.peers, 0);
    }
}

//! Room: the membership of one call
//!
//! The member map is guarded by a `tokio::sync::RwLock`. Session locks are
//! only ever taken while holding this lock, never the other way round.

use crate::session::PeerSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sfumeet_proto::{
    ConsumerId, MediaKind, PeerId, ProducerId, ProducerInfo, RoomId, ServerEnvelope,
    ServerMessage,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

pub type PeerMap = HashMap<PeerId, Arc<PeerSession>>;

pub struct Room {
    id: RoomId,
    peers: RwLock<PeerMap>,
    /// Set once the room has been emptied and dropped from the directory
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Room {
    #[must_use]
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            peers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) async fn read(&self) -> RwLockReadGuard<'_, PeerMap> {
        self.peers.read().await
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, PeerMap> {
        self.peers.write().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Caller must hold the write lock and have verified the room is empty
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub async fn session(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Deliver `message` to every active member except `excluding`.
    /// Returns the number of successful deliveries.
    pub async fn broadcast(&self, excluding: Option<&PeerId>, message: &ServerMessage) -> usize {
        let peers = self.peers.read().await;
        Self::broadcast_locked(&self.id, &peers, excluding, message)
    }

    pub(crate) fn broadcast_locked(
        room_id: &RoomId,
        peers: &PeerMap,
        excluding: Option<&PeerId>,
        message: &ServerMessage,
    ) -> usize {
        let mut delivered = 0;
        for (peer_id, session) in peers {
            if Some(peer_id) == excluding || !session.is_active() {
                continue;
            }
            // A failed delivery to one member must not stop the others
            if session.notify(ServerEnvelope::push(message.clone())) {
                delivered += 1;
            }
        }
        debug!(
            room_id = %room_id,
            message = message.name(),
            delivered,
            "Broadcast delivered"
        );
        delivered
    }

    /// Snapshot of every live producer in the room except those of `excluding`
    pub async fn list_producers(&self, excluding: &PeerId) -> Vec<ProducerInfo> {
        let peers = self.peers.read().await;
        Self::producers_locked(&peers, excluding)
    }

    pub(crate) fn producers_locked(peers: &PeerMap, excluding: &PeerId) -> Vec<ProducerInfo> {
        let mut producers: Vec<ProducerInfo> = peers
            .iter()
            .filter(|(peer_id, _)| *peer_id != excluding)
            .flat_map(|(peer_id, session)| session.lock().producer_infos(peer_id))
            .collect();
        producers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id).then(a.kind.cmp(&b.kind)));
        producers
    }

    /// Owner and kind of a live producer
    pub async fn find_producer(
        &self,
        producer_id: &ProducerId,
    ) -> Option<(Arc<PeerSession>, MediaKind)> {
        let peers = self.peers.read().await;
        peers.values().find_map(|session| {
            let kind = session.lock().owns_producer(producer_id)?;
            Some((Arc::clone(session), kind))
        })
    }

    /// Drop every other member's consumers of the given producers.
    /// With `notify`, active members are told through `producer-closed`.
    /// Returns the dropped consumer ids.
    pub async fn retire_producers(
        &self,
        owner: &PeerId,
        producer_ids: &[ProducerId],
        notify: bool,
    ) -> Vec<ConsumerId> {
        if producer_ids.is_empty() {
            return Vec::new();
        }
        let peers = self.peers.read().await;
        let mut dropped = Vec::new();
        for (peer_id, session) in peers.iter().filter(|(id, _)| *id != owner) {
            {
                let mut inner = session.lock();
                for producer_id in producer_ids {
                    if let Some(consumer) = inner.consumers.remove(producer_id) {
                        dropped.push(consumer.consumer_id);
                    }
                }
            }
            if notify && session.is_active() {
                for producer_id in producer_ids {
                    session.notify(ServerEnvelope::push(ServerMessage::ProducerClosed {
                        producer_id: producer_id.clone(),
                    }));
                }
            }
            debug!(room_id = %self.id, peer_id = %peer_id, "Retired producers for member");
        }
        dropped
    }

    pub async fn stats(&self) -> RoomStats {
        let peers = self.peers.read().await;
        let mut stats = RoomStats {
            room_id: self.id.clone(),
            peers: peers.len(),
            created_at: self.created_at,
            ..RoomStats::default()
        };
        for session in peers.values() {
            if session.is_active() {
                stats.active_peers += 1;
            }
            let counts = session.counts();
            stats.audio_producers += counts.audio_producers;
            stats.video_producers += counts.video_producers;
            stats.consumers += counts.consumers;
        }
        stats
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub peers: usize,
    pub active_peers: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
    pub consumers: usize,
    pub created_at: DateTime<Utc>,
}

impl RoomStats {
    #[must_use]
    pub const fn producers(&self) -> usize {
        self.audio_producers + self.video_producers
    }
}

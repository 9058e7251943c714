//! Producer/consumer registry
//!
//! Producers are keyed by media kind within their session, consumers by the
//! producer they receive. Every engine call is followed by a re-validation of
//! the session; anything created for a session that began leaving in the
//! meantime is closed before the error is returned.

use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::negotiator::CapabilityNegotiator;
use crate::room::Room;
use crate::session::{PeerSession, ProducerRecord};
use sfumeet_proto::{
    ConsumerDescriptor, MediaKind, ProducerId, ProducerInfo, RtpCapabilities, RtpParameters,
    ServerMessage, TransportDirection, TransportId,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Registry {
    engine: Arc<dyn MediaEngine>,
    negotiator: Arc<CapabilityNegotiator>,
}

impl Registry {
    pub fn new(engine: Arc<dyn MediaEngine>, negotiator: Arc<CapabilityNegotiator>) -> Self {
        Self { engine, negotiator }
    }

    /// Produce `kind` on the session's send transport. A live producer of
    /// the same kind is closed first. The new producer is announced to the
    /// room's other active members.
    pub async fn produce(
        &self,
        room: &Room,
        session: &PeerSession,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let previous = {
            let peers = room.write().await;
            let mut inner = session.lock();
            inner.ensure_open()?;
            inner.ensure_transports_ready()?;
            match inner.direction_of(transport_id) {
                Some(TransportDirection::Send) => {}
                Some(TransportDirection::Recv) => {
                    return Err(Error::precondition(
                        "producers require the send transport",
                    ));
                }
                None => return Err(Error::TransportNotFound(transport_id.clone())),
            }
            let previous = inner.producers.remove(&kind);
            drop(inner);
            drop(peers);
            previous
        };

        if let Some(old) = previous {
            info!(
                peer_id = %session.id(),
                producer_id = %old.id,
                kind = %kind,
                "Replacing producer"
            );
            self.close_and_retire(room, session, &old.id).await;
        }

        let produced = self.engine.produce(transport_id, kind, rtp_parameters).await;
        let producer_id = match produced {
            Ok(id) => id,
            Err(_) if session.is_leaving() => return Err(Error::SessionClosed),
            Err(e) => {
                // A failed attempt still completes negotiation
                if session.lock().activate() {
                    info!(peer_id = %session.id(), "Session active");
                }
                warn!(peer_id = %session.id(), kind = %kind, error = %e, "Produce failed");
                return Err(e.into());
            }
        };

        let peers = room.read().await;
        let (committed, stale) = {
            let mut inner = session.lock();
            if inner.ensure_open().is_err() {
                (false, None)
            } else {
                let stale = inner.producers.insert(
                    kind,
                    ProducerRecord {
                        id: producer_id.clone(),
                        kind,
                    },
                );
                if inner.activate() {
                    info!(peer_id = %session.id(), "Session active");
                }
                (true, stale)
            }
        };
        if !committed {
            drop(peers);
            warn!(
                peer_id = %session.id(),
                producer_id = %producer_id,
                "Session left during produce, closing detached producer"
            );
            self.engine.close_producer(&producer_id).await;
            return Err(Error::SessionClosed);
        }

        let announcement = ServerMessage::NewProducer(ProducerInfo {
            producer_id: producer_id.clone(),
            kind,
            peer_id: session.id().clone(),
        });
        // Announced under the room lock so it cannot trail the owner's departure
        Room::broadcast_locked(room.id(), &peers, Some(session.id()), &announcement);
        drop(peers);

        if let Some(stale) = stale {
            self.close_and_retire(room, session, &stale.id).await;
        }

        info!(
            room_id = %room.id(),
            peer_id = %session.id(),
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Consume another member's producer on the session's receive transport
    pub async fn consume(
        &self,
        room: &Room,
        session: &PeerSession,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor> {
        let recv_transport = {
            let inner = session.lock();
            inner.ensure_open()?;
            inner.ensure_transports_ready()?;
            if let Some(existing) = inner.consumers.get(producer_id) {
                debug!(
                    peer_id = %session.id(),
                    producer_id = %producer_id,
                    "Producer already consumed"
                );
                return Ok(existing.clone());
            }
            inner
                .recv_transport
                .as_ref()
                .map(|t| t.id.clone())
                .ok_or_else(|| Error::precondition("receive transport missing"))?
        };

        let (owner, kind) = room
            .find_producer(producer_id)
            .await
            .ok_or_else(|| Error::ProducerNotFound(producer_id.clone()))?;
        if owner.id() == session.id() {
            return Err(Error::precondition("cannot consume own producer"));
        }

        self.negotiator.ensure_can_consume(
            self.engine.as_ref(),
            producer_id,
            kind,
            rtp_capabilities,
        )?;

        let descriptor = match self
            .engine
            .consume(&recv_transport, producer_id, rtp_capabilities)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(_) if session.is_leaving() => return Err(Error::SessionClosed),
            Err(e) => return Err(e.into()),
        };

        let peers = room.read().await;
        let producer_live = peers
            .get(owner.id())
            .is_some_and(|o| o.lock().owns_producer(producer_id).is_some());
        let outcome = {
            let mut inner = session.lock();
            if inner.ensure_open().is_err() {
                Err(Error::SessionClosed)
            } else if !producer_live {
                Err(Error::ProducerNotFound(producer_id.clone()))
            } else {
                inner
                    .consumers
                    .insert(producer_id.clone(), descriptor.clone());
                Ok(())
            }
        };
        drop(peers);

        if let Err(e) = outcome {
            debug!(
                peer_id = %session.id(),
                consumer_id = %descriptor.consumer_id,
                error = %e,
                "Discarding consumer created for a closed session or producer"
            );
            self.engine.close_consumer(&descriptor.consumer_id).await;
            return Err(e);
        }

        debug!(
            peer_id = %session.id(),
            producer_id = %producer_id,
            consumer_id = %descriptor.consumer_id,
            "Consumer created"
        );
        Ok(descriptor)
    }

    /// Producers of every other member. Activates the session first when
    /// both of its transports are connected, so that any producer missing
    /// from the snapshot reaches it as a `new-producer` push.
    pub async fn list_producers(
        &self,
        room: &Room,
        session: &PeerSession,
    ) -> Result<Vec<ProducerInfo>> {
        let peers = room.read().await;
        {
            let mut inner = session.lock();
            inner.ensure_open()?;
            if inner.activate() {
                info!(peer_id = %session.id(), "Session active");
            }
        }
        Ok(Room::producers_locked(&peers, session.id()))
    }

    async fn close_and_retire(&self, room: &Room, session: &PeerSession, producer_id: &ProducerId) {
        self.engine.close_producer(producer_id).await;
        let dropped = room
            .retire_producers(session.id(), std::slice::from_ref(producer_id), true)
            .await;
        for consumer_id in &dropped {
            self.engine.close_consumer(consumer_id).await;
        }
    }
}

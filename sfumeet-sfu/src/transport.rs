//! Transport lifecycle: create, connect and tear down the two transports
//! of every peer session

use crate::engine::{EngineError, MediaEngine};
use crate::error::{Error, Result};
use crate::room::Room;
use crate::session::{PeerSession, SessionInner, SessionResources, TransportRecord};
use serde_json::Value;
use sfumeet_proto::{ProducerId, TransportDescriptor, TransportDirection, TransportId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TransportManager {
    engine: Arc<dyn MediaEngine>,
}

impl TransportManager {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self { engine }
    }

    /// Create the session's transport for `direction`, replacing any
    /// previous one of the same direction.
    ///
    /// If the session starts leaving while the engine call is in flight,
    /// the new transport is closed again and `SessionClosed` is returned.
    pub async fn create_transport(
        &self,
        room: &Room,
        session: &PeerSession,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor> {
        {
            let inner = session.lock();
            inner.ensure_open()?;
            if inner.device.is_none() {
                return Err(Error::precondition(
                    "router capabilities must be requested before creating transports",
                ));
            }
        }

        let descriptor = self
            .engine
            .create_transport(direction)
            .await
            .map_err(|e| match e {
                EngineError::WorkerDied => Error::from(EngineError::WorkerDied),
                other => Error::TransportCreateFailed(other.to_string()),
            })?;

        // Producers leave the room's view only under the write lock
        let peers = room.write().await;
        let committed = {
            let mut inner = session.lock();
            if inner.ensure_open().is_err() {
                None
            } else {
                Some(Self::commit(&mut inner, &descriptor.id, direction))
            }
        };
        drop(peers);
        let Some((replaced, retired)) = committed else {
            warn!(
                peer_id = %session.id(),
                transport_id = %descriptor.id,
                "Session left during transport creation, closing detached transport"
            );
            self.engine.close_transport(&descriptor.id).await;
            return Err(Error::SessionClosed);
        };

        if let Some(old) = replaced {
            info!(
                peer_id = %session.id(),
                direction = %direction,
                old_transport_id = %old.id,
                new_transport_id = %descriptor.id,
                "Replacing transport"
            );
            // Closing the transport closes everything it carried
            self.engine.close_transport(&old.id).await;
            let dropped = room.retire_producers(session.id(), &retired, true).await;
            for consumer_id in &dropped {
                self.engine.close_consumer(consumer_id).await;
            }
        }

        debug!(
            peer_id = %session.id(),
            transport_id = %descriptor.id,
            direction = %direction,
            "Transport created"
        );
        Ok(descriptor)
    }

    /// Install the new transport record. A replaced send transport takes the
    /// session's producers with it, a replaced receive transport its consumers.
    fn commit(
        inner: &mut SessionInner,
        transport_id: &TransportId,
        direction: TransportDirection,
    ) -> (Option<TransportRecord>, Vec<ProducerId>) {
        let replaced = inner
            .transport_mut(direction)
            .replace(TransportRecord::new(transport_id.clone(), direction));
        let mut retired = Vec::new();
        if replaced.is_some() {
            match direction {
                TransportDirection::Send => {
                    retired = inner.producers.drain().map(|(_, p)| p.id).collect();
                }
                TransportDirection::Recv => inner.consumers.clear(),
            }
        }
        (replaced, retired)
    }

    /// Connect a transport. Connecting an already connected transport is
    /// a no-op.
    pub async fn connect_transport(
        &self,
        session: &PeerSession,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> Result<()> {
        let direction = {
            let inner = session.lock();
            inner.ensure_open()?;
            let direction = inner
                .direction_of(transport_id)
                .ok_or_else(|| Error::TransportNotFound(transport_id.clone()))?;
            if let Some(record) = inner.transport(direction).filter(|t| t.connected) {
                if record.dtls_parameters.as_ref() != Some(&dtls_parameters) {
                    warn!(
                        peer_id = %session.id(),
                        transport_id = %transport_id,
                        "Repeated connect with different parameters ignored"
                    );
                }
                return Ok(());
            }
            direction
        };

        if let Err(e) = self
            .engine
            .connect_transport(transport_id, dtls_parameters.clone())
            .await
        {
            return Err(if session.is_leaving() {
                Error::SessionClosed
            } else {
                e.into()
            });
        }

        let mut inner = session.lock();
        inner.ensure_open()?;
        match inner.transport_mut(direction) {
            Some(record) if &record.id == transport_id => {
                record.connected = true;
                record.dtls_parameters = Some(dtls_parameters);
            }
            _ => return Err(Error::TransportNotFound(transport_id.clone())),
        }
        debug!(
            peer_id = %session.id(),
            transport_id = %transport_id,
            direction = %direction,
            "Transport connected"
        );
        Ok(())
    }

    /// Close everything a leaving session owned at the engine
    pub async fn release(&self, resources: &SessionResources) {
        for consumer_id in &resources.consumers {
            self.engine.close_consumer(consumer_id).await;
        }
        for producer_id in &resources.producers {
            self.engine.close_producer(producer_id).await;
        }
        for transport_id in &resources.transports {
            self.engine.close_transport(transport_id).await;
        }
    }
}

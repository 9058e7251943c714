//! Capability negotiation between the router and a peer's device

use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use sfumeet_proto::{MediaKind, ProducerId, RtpCapabilities};
use tracing::debug;

/// Immutable per-session snapshot of the capabilities a device may use
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCapabilitySet {
    capabilities: RtpCapabilities,
}

impl DeviceCapabilitySet {
    #[must_use]
    pub const fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.capabilities.supports_kind(kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Owns the router capabilities fixed at process start and shared by all rooms
#[derive(Debug, Clone)]
pub struct CapabilityNegotiator {
    router: RtpCapabilities,
}

impl CapabilityNegotiator {
    #[must_use]
    pub const fn new(router: RtpCapabilities) -> Self {
        Self { router }
    }

    #[must_use]
    pub const fn router_capabilities(&self) -> &RtpCapabilities {
        &self.router
    }

    /// Device capability set for a device able to handle `device`
    #[must_use]
    pub fn negotiate(&self, device: &RtpCapabilities) -> DeviceCapabilitySet {
        DeviceCapabilitySet {
            capabilities: self.router.intersect(device),
        }
    }

    /// Device capability set of a session before it has reported anything
    /// about its device: the full router set
    #[must_use]
    pub fn device_for_router(&self) -> DeviceCapabilitySet {
        self.negotiate(&self.router)
    }

    /// Must pass before any consumer is constructed
    pub fn ensure_can_consume(
        &self,
        engine: &dyn MediaEngine,
        producer_id: &ProducerId,
        kind: MediaKind,
        requester: &RtpCapabilities,
    ) -> Result<()> {
        let usable = self.negotiate(requester);
        if usable.can_produce(kind) && engine.can_consume(producer_id, requester) {
            return Ok(());
        }
        debug!(
            producer_id = %producer_id,
            kind = %kind,
            requester_codecs = requester.codecs.len(),
            "Consume not satisfiable"
        );
        Err(Error::CapabilityMismatch {
            producer_id: producer_id.clone(),
        })
    }
}

//! `SfuMeet` SFU signaling core
//!
//! This crate implements the session and peer state machine of a selective
//! forwarding unit. It negotiates and tracks the transports, producers and
//! consumers needed to move media through an external media engine, and
//! fans room membership changes out to the other peers of a room.
//!
//! ## Architecture
//!
//! - **`RoomDirectory`**: Owns every room; entry point for all peer requests
//! - **`Room`**: Member map of one call and its broadcast primitive
//! - **`PeerSession`**: One participant, driven `Joining → Negotiating → Active → Leaving`
//! - **`CapabilityNegotiator`**: Router capabilities and consume checks
//! - **`TransportManager`**: Send/receive transport lifecycle
//! - **`Registry`**: Producers (one per kind) and consumers (one per producer)
//! - **`MediaEngine`**: Boundary to the engine doing RTP, ICE and DTLS
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfumeet_sfu::{LocalEngine, RoomDirectory, SfuConfig};
//!
//! let engine = Arc::new(LocalEngine::default());
//! let directory = RoomDirectory::new(engine, SfuConfig::default());
//! let session = directory.join(room_id, peer_id, sender).await?;
//! let caps = directory.router_capabilities(&room_id, &peer_id).await?;
//! ```

mod config;
mod directory;
pub mod engine;
mod error;
mod negotiator;
mod registry;
mod room;
mod sender;
mod session;
mod transport;

pub use config::SfuConfig;
pub use directory::{DirectoryStats, RoomDirectory};
pub use engine::{EngineError, EngineStats, LocalEngine, LocalEngineConfig, MediaEngine};
pub use error::{Error, Result};
pub use negotiator::{CapabilityNegotiator, DeviceCapabilitySet};
pub use registry::Registry;
pub use room::{Room, RoomStats};
pub use sender::{BoundedSender, MessageSender};
pub use session::{PeerSession, SessionResources, SessionState};
pub use transport::TransportManager;

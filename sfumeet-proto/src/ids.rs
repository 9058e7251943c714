//! Identifier newtypes
//!
//! Peer identifiers are connection-scoped nanoids allocated by the server;
//! transport, producer and consumer identifiers are uuids handed out by the
//! media engine. All of them are opaque strings on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a 12-character nanoid
#[must_use]
pub fn generate_id() -> String {
    nanoid::nanoid!(12)
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(
    /// Unique identifier for a peer session (one per signaling connection)
    PeerId
);

define_id!(
    /// Opaque room identifier chosen by the joining peer
    RoomId
);

define_id!(
    /// Media engine transport identifier
    TransportId
);

define_id!(
    /// Media engine producer identifier
    ProducerId
);

define_id!(
    /// Media engine consumer identifier
    ConsumerId
);

impl PeerId {
    /// Allocate a fresh connection-scoped peer id
    #[must_use]
    pub fn generate() -> Self {
        Self(generate_id())
    }
}

impl TransportId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ProducerId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ConsumerId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

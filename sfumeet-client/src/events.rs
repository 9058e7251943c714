//! Events emitted to the UI layer

use crate::capture::LocalTrack;
use sfumeet_proto::{MediaKind, PeerId, ProducerId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Joined {
        room_id: RoomId,
        peer_id: PeerId,
    },
    /// Local tracks that are now being sent
    LocalMediaReady { tracks: Vec<LocalTrack> },
    /// A remote producer is being received; UI handles are keyed by `producer_id`
    RemoteMediaAdded {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
    },
    RemoteMediaRemoved { producer_id: ProducerId },
    /// Non-fatal failure to show the user
    Banner { message: String },
    /// Everything is closed and released
    Left,
}

// SfuMeet API Library
//
// Provides the signaling channel and the HTTP/WebSocket surface of SfuMeet

pub mod http;
pub mod signaling;

// Re-export commonly used types
pub use http::{create_router, AppState};
pub use signaling::{ChannelStream, JsonCodec, SignalingHandler, StreamMessage};

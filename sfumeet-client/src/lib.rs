//! `SfuMeet` client session orchestrator
//!
//! The peer side of a call: joins a room over a signaling channel,
//! negotiates a device against the router capabilities, opens the send and
//! receive transports, publishes local media once the user consented and
//! receives every remote producer announced in the room.
//!
//! ## Architecture
//!
//! - **`ClientSession`**: Request/response sequencing, push handling, teardown
//! - **`ClientChannel`**: Signaling pipe (`MemoryChannel`, `WebSocketChannel`)
//! - **`ClientEngine`**: Client half of the media engine (`BasicDevice`)
//! - **`MediaCapture`**: Camera and microphone access (`SyntheticCapture`)
//! - **`ClientEvent`**: What the UI renders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfumeet_client::{BasicDevice, ClientSession, MediaOptions, SyntheticCapture, WebSocketChannel};
//!
//! let channel = WebSocketChannel::connect("ws://127.0.0.1:5000/ws").await?;
//! let (mut session, mut events) = ClientSession::new(
//!     channel,
//!     Arc::new(BasicDevice::default()),
//!     Arc::new(SyntheticCapture::new()),
//! );
//! session.join(RoomId::from("standup"), MediaOptions::all()).await?;
//! while session.handle_next().await? {}
//! session.leave().await;
//! ```

mod capture;
mod channel;
mod device;
mod error;
mod events;
mod session;

pub use capture::{LocalTrack, MediaCapture, MediaOptions, SyntheticCapture};
pub use channel::{ClientChannel, MemoryChannel, WebSocketChannel};
pub use device::{BasicDevice, ClientEngine, DeviceCounts, RemoteTrack};
pub use error::{ClientError, Result};
pub use events::ClientEvent;
pub use session::{ClientSession, RemoteMedia};

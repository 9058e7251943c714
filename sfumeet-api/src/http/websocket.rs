//! WebSocket handler with JSON text frames
//!
//! This handler uses the `StreamMessage` trait from the signaling module;
//! all request handling is done by `SignalingHandler::run()` with the
//! `WebSocketStream` implementation.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use sfumeet_proto::{ClientEnvelope, RoomId, ServerEnvelope};
use sfumeet_sfu::{BoundedSender, MessageSender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::{AppError, AppState};
use crate::signaling::{JsonCodec, SignalingHandler, StreamMessage};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    /// Join this room as soon as the connection is up
    pub room_id: Option<String>,
}

/// WebSocket stream implementation of `StreamMessage` trait
///
/// This adapts axum's `WebSocket` to the signaling `StreamMessage` interface.
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: BoundedSender,
    is_alive: Arc<AtomicBool>,
}

impl WebSocketStream {
    async fn next_frame(&mut self) -> Option<Result<ClientEnvelope, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(JsonCodec::decode_client_message(text.as_str()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let decoded = std::str::from_utf8(&bytes)
                        .map_err(|e| format!("Invalid UTF-8 frame: {e}"))
                        .and_then(JsonCodec::decode_client_message);
                    return Some(decoded);
                }
                Some(Ok(Message::Close(_))) => return None, // Graceful close
                Some(Err(e)) => {
                    debug!("WebSocket error: {e}");
                    return None;
                }
                None => return None, // Stream ended
                Some(Ok(_)) => {
                    // Ignore ping/pong and continue loop
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl StreamMessage for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<ClientEnvelope, String>> {
        // A full outbound queue ends the connection like a client close
        let sender = self.sender.clone();
        let is_alive = Arc::clone(&self.is_alive);
        tokio::select! {
            () = sender.overflowed() => {
                warn!("Outbound queue full, closing WebSocket connection");
                is_alive.store(false, Ordering::Relaxed);
                None
            }
            frame = self.next_frame() => frame,
        }
    }

    fn send(&self, message: ServerEnvelope) -> Result<(), String> {
        MessageSender::send(&self.sender, message)
    }

    fn sender(&self) -> Arc<dyn MessageSender> {
        Arc::new(self.sender.clone())
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

/// WebSocket handler for signaling
///
/// <ws://host/ws?roomId={room_id}> joins the room right away; without the
/// query the client sends `join-room` itself.
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    if state.directory.is_shutdown() {
        return Err(AppError::service_unavailable("Media engine unavailable"));
    }
    let room_id = match query.room_id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError::bad_request("roomId must not be empty"));
        }
        Some(id) => Some(RoomId::from(id)),
        None => None,
    };

    Ok(ws
        .max_message_size(state.signaling.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: Option<RoomId>) {
    let handler = SignalingHandler::new(Arc::clone(&state.directory));
    info!(
        peer_id = %handler.peer_id(),
        room_id = ?room_id,
        "WebSocket connection established"
    );

    // Bounded outbound queue; a client that lets it fill up is disconnected
    let (tx, mut rx) = mpsc::channel::<ServerEnvelope>(state.signaling.send_buffer);
    let is_alive = Arc::new(AtomicBool::new(true));

    let (mut ws_sink, ws_receiver) = socket.split();

    // Spawn task to handle server messages -> WebSocket
    let writer = {
        let is_alive = Arc::clone(&is_alive);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match JsonCodec::encode_server_message(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("{e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    debug!("Failed to send WebSocket message: {e}");
                    is_alive.store(false, Ordering::Relaxed);
                    break;
                }
            }
            let _ = ws_sink.close().await;
        })
    };

    let mut stream = WebSocketStream {
        receiver: ws_receiver,
        sender: BoundedSender::new(tx),
        is_alive,
    };

    handler.run(&mut stream, room_id).await;

    // The peer is gone, whatever is still queued cannot be delivered
    drop(stream);
    writer.abort();

    info!(peer_id = %handler.peer_id(), "WebSocket connection closed");
}

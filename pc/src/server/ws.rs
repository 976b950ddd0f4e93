//! WebSocket transport
//!
//! Each inbound text frame is a `TurnRequest`. Events go out as JSON text
//! frames followed by a `[DONE]` frame. Requests arriving mid-turn get an
//! error event under their own sequence id and are otherwise ignored.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AppState, start_turn};
use crate::events::{END_OF_STREAM, EventEnvelope, TurnEvent};
use crate::session::{ChatSession, TurnRequest};

/// `GET /v1/ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Outcome of relaying one turn
enum Relay {
    Done,
    Disconnected,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket client connected");
    let session = ChatSession::new();
    let (mut sender, mut receiver) = socket.split();

    while let Some(inbound) = receiver.next().await {
        let text = match inbound {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
        };
        debug!(len = text.len(), "handle_socket: received turn request");

        let request: TurnRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                if reject(&mut sender, &format!("Invalid turn request: {}", e)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let turn = match session.begin(request) {
            Ok(turn) => turn,
            Err(e) => {
                if reject(&mut sender, &e.to_string()).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let rx = start_turn(Arc::clone(&state.orchestrator), turn, state.event_buffer);
        match relay(rx, &mut sender, &mut receiver).await {
            Relay::Done => {}
            Relay::Disconnected => break,
        }
    }

    info!("WebSocket connection closed");
}

/// Forward one turn's events, watching the socket for a disconnect
async fn relay(
    mut rx: tokio::sync::mpsc::Receiver<EventEnvelope>,
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
) -> Relay {
    loop {
        tokio::select! {
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                match envelope.to_json() {
                    Ok(json) => {
                        if sender.send(Message::Text(json)).await.is_err() {
                            return Relay::Disconnected;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping unserializable event"),
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(_))) => {
                    if send_error(sender, "A turn is already in progress for this session").await.is_err() {
                        return Relay::Disconnected;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Relay::Disconnected,
                Some(Ok(_)) => {}
            },
        }
    }

    match sender.send(Message::Text(END_OF_STREAM.to_string())).await {
        Ok(()) => Relay::Done,
        Err(_) => Relay::Disconnected,
    }
}

/// Error outside any turn, followed by the sentinel
async fn reject(sender: &mut SplitSink<WebSocket, Message>, message: &str) -> Result<(), axum::Error> {
    send_error(sender, message).await?;
    sender.send(Message::Text(END_OF_STREAM.to_string())).await
}

/// Turn-scoped error under a fresh sequence id
async fn send_error(sender: &mut SplitSink<WebSocket, Message>, message: &str) -> Result<(), axum::Error> {
    let envelope = EventEnvelope::new(
        Uuid::now_v7(),
        TurnEvent::Error {
            content: message.to_string(),
            metadata: None,
        },
    );
    let json = envelope.to_json().unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(json)).await
}

//! HTTP / WebSocket front end
//!
//! - `GET /health`
//! - `POST /v1/chat`: one turn per request, streamed as server-sent events
//! - `GET /v1/ws`: one session per connection, one turn per inbound frame
//!
//! Both transports end every turn with the `[DONE]` sentinel.

mod sse;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::{Json, Router};
use eyre::{Context, Result};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::events::{EventEnvelope, channel};
use crate::orchestrator::Orchestrator;
use crate::session::{ActiveTurn, ChatSession};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    /// Conversation behind `POST /v1/chat`; WebSocket connections get their own
    session: Arc<ChatSession>,
    keepalive: Duration,
    event_buffer: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &ServerConfig) -> Self {
        debug!(?config, "AppState::new: called");
        Self {
            orchestrator,
            session: ChatSession::new(),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
            event_buffer: config.event_buffer,
        }
    }

    pub fn session(&self) -> &Arc<ChatSession> {
        &self.session
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    code: String,
    message: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(sse::chat_handler))
        .route("/v1/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Serve until the listener fails
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!(%addr, "Server listening");
    axum::serve(listener, router(state))
        .await
        .context("Server terminated with error")
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Run the claimed turn on its own task and hand back its event stream
///
/// Dropping the receiver cancels the turn. The session claim is released
/// when the task ends, after a successful turn has been archived.
pub(crate) fn start_turn(
    orchestrator: Arc<Orchestrator>,
    turn: ActiveTurn,
    buffer: usize,
) -> mpsc::Receiver<EventEnvelope> {
    let (emitter, rx) = channel(buffer);
    tokio::spawn(async move {
        let conversation = turn.conversation().to_vec();
        match orchestrator.run_turn(conversation, &emitter).await {
            Ok(summary) => turn.finish(&summary),
            Err(e) => {
                warn!(sequence_id = %emitter.sequence_id(), error = %e, "Turn abandoned");
                drop(turn);
            }
        }
        // the stream ends only after the session claim is released
        drop(emitter);
    });
    rx
}

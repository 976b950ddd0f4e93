//! Server-sent events transport

use std::convert::Infallible;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, stream};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{AppState, ErrorBody, start_turn};
use crate::events::{END_OF_STREAM, EventEnvelope};
use crate::session::{SessionError, TurnRequest};

/// `POST /v1/chat`
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<ErrorBody>)> {
    debug!(?request, "chat_handler: called");
    let turn = state.session.begin(request).map_err(map_session_error)?;
    let rx = start_turn(state.orchestrator.clone(), turn, state.event_buffer);

    let events = ReceiverStream::new(rx)
        .filter_map(|envelope| async move { to_sse(&envelope) })
        .chain(stream::once(async { Ok(Event::default().data(END_OF_STREAM)) }));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keepalive).text("keepalive")))
}

fn to_sse(envelope: &EventEnvelope) -> Option<Result<Event, Infallible>> {
    match envelope.to_json() {
        Ok(json) => Some(Ok(Event::default().data(json))),
        Err(e) => {
            warn!(event_type = envelope.event.event_type(), error = %e, "Dropping unserializable event");
            None
        }
    }
}

fn map_session_error(err: SessionError) -> (StatusCode, Json<ErrorBody>) {
    let (status, code) = match err {
        SessionError::Busy => (StatusCode::CONFLICT, "conflict"),
        SessionError::NoUserMessage => (StatusCode::BAD_REQUEST, "invalid_argument"),
    };
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message: err.to_string(),
        }),
    )
}

//! Chat session - conversation history and the one-turn-at-a-time rule

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::llm::{Message, Role};
use crate::orchestrator::TurnSummary;

/// Inbound request that starts one turn
///
/// `conversation` (alias `messages`) replaces the session history;
/// `message` appends one user message to it. Both may be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    #[serde(default, alias = "messages", skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Vec<Message>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TurnRequest {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            conversation: None,
            message: Some(text.into()),
        }
    }

    pub fn conversation(messages: Vec<Message>) -> Self {
        Self {
            conversation: Some(messages),
            message: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A turn is already in progress for this session")]
    Busy,

    #[error("No user query found in messages")]
    NoUserMessage,
}

/// In-memory conversation shared by the turns of one client
#[derive(Debug, Default)]
pub struct ChatSession {
    history: Mutex<Vec<Message>>,
    active: AtomicBool,
}

impl ChatSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.lock().map(|h| h.clone()).unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the session for one turn and build that turn's conversation
    ///
    /// The claim is released when the returned `ActiveTurn` is dropped.
    pub fn begin(self: &Arc<Self>, request: TurnRequest) -> Result<ActiveTurn, SessionError> {
        debug!(?request, "ChatSession::begin: called");
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::Busy);
        }
        let mut turn = ActiveTurn {
            session: Arc::clone(self),
            conversation: request.conversation.unwrap_or_else(|| self.history()),
        };

        if let Some(text) = request.message {
            turn.conversation.push(Message::user(text));
        }
        let has_query = turn
            .conversation
            .iter()
            .any(|m| m.role == Role::User && !m.content.trim().is_empty());
        if !has_query {
            // dropping the turn releases the claim
            return Err(SessionError::NoUserMessage);
        }
        Ok(turn)
    }

    fn store(&self, messages: Vec<Message>) {
        match self.history.lock() {
            Ok(mut history) => *history = messages,
            Err(e) => *e.into_inner() = messages,
        }
    }
}

/// Exclusive claim on a session for the duration of one turn
#[derive(Debug)]
pub struct ActiveTurn {
    session: Arc<ChatSession>,
    conversation: Vec<Message>,
}

impl ActiveTurn {
    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    /// Archive the turn: the conversation plus one synthesized assistant
    /// message becomes the session history
    pub fn finish(mut self, summary: &TurnSummary) {
        let mut messages = std::mem::take(&mut self.conversation);
        match &summary.final_response {
            Some(answer) => {
                messages.push(Message::assistant(answer.clone()));
                info!(history_len = messages.len(), "Turn archived into session history");
            }
            None => debug!("ActiveTurn::finish: no final answer to archive"),
        }
        self.session.store(messages);
    }
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        self.session.active.store(false, Ordering::SeqCst);
    }
}

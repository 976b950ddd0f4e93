//! Orchestrator error types

use thiserror::Error;

use super::parser::ParseError;
use super::state::TransitionError;
use crate::events::ChannelError;
use crate::llm::LlmError;

/// Failure of a single orchestration step (decompose, evaluate, rebranch, synthesize)
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Model gateway error: {0}")]
    Gateway(#[from] LlmError),

    #[error("Could not parse model reply: {0}")]
    Parse(#[from] ParseError),

    #[error("Prompt rendering failed: {0}")]
    Prompt(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl StepError {
    pub fn is_channel(&self) -> bool {
        matches!(self, StepError::Channel(_))
    }
}

/// Why a turn ended without a final answer
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Decomposition failed: {0}")]
    Decompose(StepError),

    #[error("All {0} branches failed")]
    AllBranchesFailed(usize),

    #[error("Synthesis failed: {0}")]
    Synthesize(StepError),

    #[error("Conversation has no user message")]
    EmptyConversation,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl TurnError {
    /// Lift a step failure into the turn, keeping channel loss distinct
    pub fn from_step(err: StepError, wrap: fn(StepError) -> TurnError) -> Self {
        match err {
            StepError::Channel(c) => TurnError::Channel(c),
            other => wrap(other),
        }
    }

    /// The client is gone; nothing more can be reported
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TurnError::Channel(_))
    }
}

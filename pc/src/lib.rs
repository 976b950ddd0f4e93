//! ParallelChat - parallel research chat
//!
//! A question is decomposed into one shared skeleton prompt plus several
//! injections. Each injection runs as its own branch against the model,
//! concurrently. Promising paths may get further rounds, and the results are
//! synthesized into one answer. Every step is streamed to the client as a
//! typed event.
//!
//! # Modules
//!
//! - [`llm`] - LLM client trait plus Anthropic and OpenAI implementations
//! - [`orchestrator`] - decomposition, branching, rebranching, synthesis
//! - [`events`] - the outbound event protocol and per-turn channel
//! - [`prompts`] - prompt templates with file overrides
//! - [`session`] - conversation history and the one-turn-at-a-time rule
//! - [`server`] - SSE and WebSocket transports
//! - [`eval`] - orchestrated vs. direct answer comparison
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod eval;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod server;
pub mod session;

// Re-export commonly used types
pub use config::{Config, LlmConfig, OrchestratorConfig, ServerConfig};
pub use events::{ChannelError, EventEnvelope, TurnEmitter, TurnEvent, channel};
pub use llm::{
    AnthropicClient, CompletionRequest, CompletionResponse, LlmClient, LlmError, Message, OpenAIClient, Role,
    StreamChunk, create_client,
};
pub use orchestrator::{Orchestrator, ParseError, Phase, TurnError, TurnSummary};
pub use prompts::PromptLoader;
pub use session::{ChatSession, TurnRequest};

//! Turn event protocol
//!
//! Every observable step of a turn is a [`TurnEvent`]. The orchestrator emits
//! them through a [`TurnEmitter`]; the transport layer (SSE, WebSocket or the
//! CLI renderer) is the single consumer of each turn's channel.
//!
//! ```text
//!  Decomposer ──┐
//!  Branches ────┼──> TurnEmitter ──(bounded mpsc)──> SSE / WebSocket / CLI
//!  Rebrancher ──┤                                     then "[DONE]"
//!  Synthesizer ─┘
//! ```

mod emitter;
mod types;

pub use emitter::{ChannelError, TurnEmitter, channel};
pub use types::{
    ChunkMeta, CompletionMeta, CompletionStatus, END_OF_STREAM, ErrorMeta, EventEnvelope, RebranchEndMeta,
    RebranchStartMeta, StreamEndMeta, StreamStartMeta, ThinkingEndMeta, ThinkingStartMeta, TurnEvent,
};

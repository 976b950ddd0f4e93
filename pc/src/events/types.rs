//! Event types for turn progress streaming
//!
//! The wire shape of every record is
//! `{ "type", "sequence_id", "timestamp", "task_id"?, "content"?, "metadata"? }`.
//! Each variant carries only the content/metadata its type needs.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel written after the last event of a turn
pub const END_OF_STREAM: &str = "[DONE]";

/// Core event enum - the vocabulary of a turn
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    // === Decomposition ===
    /// Decomposition call issued
    ThinkingStart { content: String, metadata: ThinkingStartMeta },
    /// Decomposition parsed
    ThinkingEnd { content: String, metadata: ThinkingEndMeta },

    // === Rebranching ===
    /// A rebranch round begins
    RebranchStart { content: String, metadata: RebranchStartMeta },
    /// The rebranch round's new injections are ready
    RebranchEnd { content: String, metadata: RebranchEndMeta },

    // === Branches and synthesis ===
    /// One branch begins
    StreamStart { metadata: StreamStartMeta },
    /// Incremental text from a branch or from synthesis
    ContentChunk { content: String, metadata: ChunkMeta },
    /// One branch completed; content is the full branch text
    StreamEnd { content: String, metadata: StreamEndMeta },
    /// The whole synthesized answer
    FinalResponse { content: String },

    // === Completion ===
    /// Turn finished
    Metadata { metadata: CompletionMeta },
    /// Branch-scoped (with metadata) or turn-fatal (without) error
    Error {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<ErrorMeta>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThinkingStartMeta {
    pub stage: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThinkingEndMeta {
    pub task_count: usize,
    pub task_subjects: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebranchStartMeta {
    pub rebranch_iteration: u32,
    pub promising_paths: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RebranchEndMeta {
    pub rebranch_iteration: u32,
    pub new_tasks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamStartMeta {
    pub task_index: usize,
    pub subject: String,
    pub rebranch_iteration: u32,
}

/// Chunk metadata: branch chunks carry an index, synthesis chunks carry the final flag
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebranch_iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_final_response: bool,
}

impl ChunkMeta {
    pub fn branch(task_index: usize, rebranch_iteration: u32) -> Self {
        Self {
            task_index: Some(task_index),
            rebranch_iteration: Some(rebranch_iteration),
            is_final_response: false,
        }
    }

    pub fn final_response() -> Self {
        Self {
            task_index: None,
            rebranch_iteration: None,
            is_final_response: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamEndMeta {
    pub task_index: usize,
    pub subject: String,
    pub rebranch_iteration: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    AllComplete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionMeta {
    pub status: CompletionStatus,
    pub task_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorMeta {
    pub task_index: usize,
    pub rebranch_iteration: u32,
}

impl TurnEvent {
    /// Get the event type name for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::ThinkingStart { .. } => "thinking_start",
            TurnEvent::ThinkingEnd { .. } => "thinking_end",
            TurnEvent::RebranchStart { .. } => "rebranch_start",
            TurnEvent::RebranchEnd { .. } => "rebranch_end",
            TurnEvent::StreamStart { .. } => "stream_start",
            TurnEvent::ContentChunk { .. } => "content_chunk",
            TurnEvent::StreamEnd { .. } => "stream_end",
            TurnEvent::FinalResponse { .. } => "final_response",
            TurnEvent::Metadata { .. } => "metadata",
            TurnEvent::Error { .. } => "error",
        }
    }

    /// `(rebranch_iteration, task_index)` for branch-scoped events
    pub fn branch_scope(&self) -> Option<(u32, usize)> {
        match self {
            TurnEvent::StreamStart { metadata } => Some((metadata.rebranch_iteration, metadata.task_index)),
            TurnEvent::StreamEnd { metadata, .. } => Some((metadata.rebranch_iteration, metadata.task_index)),
            TurnEvent::ContentChunk { metadata, .. } => metadata
                .task_index
                .map(|i| (metadata.rebranch_iteration.unwrap_or(0), i)),
            TurnEvent::Error { metadata: Some(m), .. } => Some((m.rebranch_iteration, m.task_index)),
            _ => None,
        }
    }

    /// Text content, if the variant has any
    pub fn content(&self) -> Option<&str> {
        match self {
            TurnEvent::ThinkingStart { content, .. }
            | TurnEvent::ThinkingEnd { content, .. }
            | TurnEvent::RebranchStart { content, .. }
            | TurnEvent::RebranchEnd { content, .. }
            | TurnEvent::ContentChunk { content, .. }
            | TurnEvent::StreamEnd { content, .. }
            | TurnEvent::FinalResponse { content }
            | TurnEvent::Error { content, .. } => Some(content),
            TurnEvent::StreamStart { .. } | TurnEvent::Metadata { .. } => None,
        }
    }

    /// True for events that end a branch (`stream_end` or a scoped `error`)
    pub fn is_branch_terminal(&self) -> bool {
        matches!(self, TurnEvent::StreamEnd { .. } | TurnEvent::Error { metadata: Some(_), .. })
    }

    /// True for a turn-scoped error
    pub fn is_turn_error(&self) -> bool {
        matches!(self, TurnEvent::Error { metadata: None, .. })
    }
}

/// One outbound record: a [`TurnEvent`] stamped with its turn id and time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: TurnEvent,

    /// Same for every event of one turn
    pub sequence_id: Uuid,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    /// `{sequence_id}-task-{iteration}-{index}` for branch-scoped events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl EventEnvelope {
    pub fn new(sequence_id: Uuid, event: TurnEvent) -> Self {
        let task_id = event
            .branch_scope()
            .map(|(iteration, index)| format!("{}-task-{}-{}", sequence_id, iteration, index));
        Self {
            event,
            sequence_id,
            timestamp: Utc::now().timestamp_millis(),
            task_id,
        }
    }

    /// Serialize to a single-line JSON record
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

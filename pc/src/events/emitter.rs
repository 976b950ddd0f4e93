//! TurnEmitter - the outbound event channel of one turn
//!
//! A bounded mpsc channel with exactly one consumer. Emitting blocks when
//! the consumer falls behind and fails once the consumer is gone, which is
//! how a client disconnect reaches the orchestrator.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::types::{
    ChunkMeta, CompletionMeta, CompletionStatus, ErrorMeta, EventEnvelope, RebranchEndMeta, RebranchStartMeta,
    StreamEndMeta, StreamStartMeta, ThinkingEndMeta, ThinkingStartMeta, TurnEvent,
};

/// Outbound transport failure
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Event channel consumer disconnected")]
    Disconnected,
}

/// Create the event channel for one turn
pub fn channel(capacity: usize) -> (TurnEmitter, mpsc::Receiver<EventEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let emitter = TurnEmitter {
        tx,
        sequence_id: Uuid::now_v7(),
    };
    debug!(sequence_id = %emitter.sequence_id, capacity, "channel: created turn channel");
    (emitter, rx)
}

/// Handle for components to emit events of one turn
///
/// Cheap to clone; every clone stamps the same sequence id.
#[derive(Clone, Debug)]
pub struct TurnEmitter {
    tx: mpsc::Sender<EventEnvelope>,
    sequence_id: Uuid,
}

impl TurnEmitter {
    /// Get the sequence ID this emitter stamps on every event
    pub fn sequence_id(&self) -> Uuid {
        self.sequence_id
    }

    /// Emit a raw event
    pub async fn emit(&self, event: TurnEvent) -> Result<(), ChannelError> {
        debug!(event_type = event.event_type(), "TurnEmitter::emit");
        self.tx
            .send(EventEnvelope::new(self.sequence_id, event))
            .await
            .map_err(|_| ChannelError::Disconnected)
    }

    /// True once the consumer has dropped its receiver
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer drops its receiver
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    // === Convenience methods ===

    pub async fn thinking_start(&self, content: &str) -> Result<(), ChannelError> {
        self.emit(TurnEvent::ThinkingStart {
            content: content.to_string(),
            metadata: ThinkingStartMeta {
                stage: "decomposition".to_string(),
            },
        })
        .await
    }

    pub async fn thinking_end(&self, summary: &str, task_subjects: Vec<String>) -> Result<(), ChannelError> {
        self.emit(TurnEvent::ThinkingEnd {
            content: summary.to_string(),
            metadata: ThinkingEndMeta {
                task_count: task_subjects.len(),
                task_subjects,
            },
        })
        .await
    }

    pub async fn rebranch_start(
        &self,
        content: &str,
        rebranch_iteration: u32,
        promising_paths: Vec<String>,
    ) -> Result<(), ChannelError> {
        self.emit(TurnEvent::RebranchStart {
            content: content.to_string(),
            metadata: RebranchStartMeta {
                rebranch_iteration,
                promising_paths,
            },
        })
        .await
    }

    pub async fn rebranch_end(
        &self,
        content: &str,
        rebranch_iteration: u32,
        new_tasks: Vec<String>,
    ) -> Result<(), ChannelError> {
        self.emit(TurnEvent::RebranchEnd {
            content: content.to_string(),
            metadata: RebranchEndMeta {
                rebranch_iteration,
                new_tasks,
            },
        })
        .await
    }

    pub async fn stream_start(&self, task_index: usize, subject: &str, iteration: u32) -> Result<(), ChannelError> {
        self.emit(TurnEvent::StreamStart {
            metadata: StreamStartMeta {
                task_index,
                subject: subject.to_string(),
                rebranch_iteration: iteration,
            },
        })
        .await
    }

    pub async fn content_chunk(&self, task_index: usize, iteration: u32, delta: &str) -> Result<(), ChannelError> {
        self.emit(TurnEvent::ContentChunk {
            content: delta.to_string(),
            metadata: ChunkMeta::branch(task_index, iteration),
        })
        .await
    }

    pub async fn stream_end(
        &self,
        task_index: usize,
        subject: &str,
        iteration: u32,
        output: &str,
    ) -> Result<(), ChannelError> {
        self.emit(TurnEvent::StreamEnd {
            content: output.to_string(),
            metadata: StreamEndMeta {
                task_index,
                subject: subject.to_string(),
                rebranch_iteration: iteration,
            },
        })
        .await
    }

    /// Error scoped to one branch
    pub async fn branch_error(&self, task_index: usize, iteration: u32, message: &str) -> Result<(), ChannelError> {
        self.emit(TurnEvent::Error {
            content: message.to_string(),
            metadata: Some(ErrorMeta {
                task_index,
                rebranch_iteration: iteration,
            }),
        })
        .await
    }

    /// Error that ends the turn
    pub async fn turn_error(&self, message: &str) -> Result<(), ChannelError> {
        self.emit(TurnEvent::Error {
            content: message.to_string(),
            metadata: None,
        })
        .await
    }

    /// Streamed piece of the synthesized answer
    pub async fn final_chunk(&self, delta: &str) -> Result<(), ChannelError> {
        self.emit(TurnEvent::ContentChunk {
            content: delta.to_string(),
            metadata: ChunkMeta::final_response(),
        })
        .await
    }

    pub async fn final_response(&self, content: &str) -> Result<(), ChannelError> {
        self.emit(TurnEvent::FinalResponse {
            content: content.to_string(),
        })
        .await
    }

    /// Turn finished; `task_count` is the number of branches run across all rounds
    pub async fn all_complete(&self, task_count: usize) -> Result<(), ChannelError> {
        self.emit(TurnEvent::Metadata {
            metadata: CompletionMeta {
                status: CompletionStatus::AllComplete,
                task_count,
            },
        })
        .await
    }
}

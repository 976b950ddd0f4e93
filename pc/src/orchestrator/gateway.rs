//! Bounded access to the model gateway
//!
//! Every call the orchestrator makes goes through here: a shared semaphore
//! caps simultaneous calls and each call carries its own deadline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tracing::debug;

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, StreamChunk};

/// LLM client plus the concurrency limit shared by all phases of all turns
#[derive(Clone)]
pub struct Gateway {
    llm: Arc<dyn LlmClient>,
    limiter: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(llm: Arc<dyn LlmClient>, max_concurrent_calls: usize) -> Self {
        debug!(max_concurrent_calls, "Gateway::new: called");
        Self {
            llm,
            limiter: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    /// Slots currently free
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Blocking completion with a deadline
    pub async fn complete(
        &self,
        request: CompletionRequest,
        timeout: Duration,
    ) -> Result<CompletionResponse, LlmError> {
        debug!(?timeout, "Gateway::complete: called");
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| LlmError::InvalidResponse("Gateway concurrency limiter closed".to_string()))?;

        tokio::time::timeout(timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
    }

    /// Streaming completion with a deadline
    ///
    /// `chunk_tx` is dropped when the call finishes or times out, so a
    /// receiver loop on the other end always terminates.
    pub async fn stream(
        &self,
        request: CompletionRequest,
        timeout: Duration,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        debug!(?timeout, "Gateway::stream: called");
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| LlmError::InvalidResponse("Gateway concurrency limiter closed".to_string()))?;

        tokio::time::timeout(timeout, self.llm.stream(request, chunk_tx))
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
    }
}

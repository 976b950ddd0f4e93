//! Decomposer - splits a query into a skeleton plus injections

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::error::StepError;
use super::gateway::Gateway;
use super::parser::{DecompositionResult, parse_decomposition};
use crate::events::TurnEmitter;
use crate::llm::{CompletionRequest, Message, Role};
use crate::prompts::{DecomposeContext, PromptLoader};

pub struct Decomposer {
    gateway: Gateway,
    prompts: Arc<PromptLoader>,
    marker: String,
    max_branches: usize,
    timeout: Duration,
    max_tokens: u32,
}

impl Decomposer {
    pub fn new(
        gateway: Gateway,
        prompts: Arc<PromptLoader>,
        marker: String,
        max_branches: usize,
        timeout: Duration,
        max_tokens: u32,
    ) -> Self {
        debug!(%marker, max_branches, ?timeout, "Decomposer::new: called");
        Self {
            gateway,
            prompts,
            marker,
            max_branches,
            timeout,
            max_tokens,
        }
    }

    /// One decomposition call, bracketed by `thinking_start` / `thinking_end`
    ///
    /// `thinking_end` is only emitted after a successful parse.
    pub async fn decompose(
        &self,
        conversation: &[Message],
        emitter: &TurnEmitter,
    ) -> Result<DecompositionResult, StepError> {
        debug!(message_count = conversation.len(), "Decomposer::decompose: called");
        emitter.thinking_start("Analyzing query...").await?;

        let query = conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let system_prompt = self
            .prompts
            .render(
                "decompose",
                &DecomposeContext {
                    query,
                    marker: self.marker.clone(),
                    max_branches: self.max_branches,
                },
            )
            .map_err(|e| StepError::Prompt(e.to_string()))?;

        let request = CompletionRequest {
            system_prompt,
            messages: conversation.to_vec(),
            max_tokens: self.max_tokens,
        };

        let response = self.gateway.complete(request, self.timeout).await?;
        let decomposition = parse_decomposition(response.text_or_empty(), &self.marker, self.max_branches)?;

        info!(
            injection_count = decomposition.injections.len(),
            synthesize = decomposition.synthesize,
            "Query decomposed"
        );
        emitter
            .thinking_end(&decomposition.summary, decomposition.subjects())
            .await?;
        Ok(decomposition)
    }
}

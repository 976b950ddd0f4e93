//! Branch entity and executor
//!
//! A branch is one research angle run against the model. Its executor emits
//! `stream_start`, then any `content_chunk`s, then exactly one terminal
//! event (`stream_end` or a scoped `error`). Gateway failures never leave
//! the executor; only a dead event channel does.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::gateway::Gateway;
use super::parser::Injection;
use crate::events::{ChannelError, TurnEmitter};
use crate::llm::{CompletionRequest, LlmError, Message, Role, StreamChunk};
use crate::prompts::PromptLoader;

/// Lifecycle of a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Pending,
    Streaming,
    Complete,
    Errored,
}

impl BranchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BranchStatus::Complete | BranchStatus::Errored)
    }
}

/// One research angle within a turn
///
/// `output` accumulates streamed text while `Streaming` and is frozen once
/// the branch reaches a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct Branch {
    pub index: usize,
    pub iteration: u32,
    pub subject: String,
    pub injection: String,
    status: BranchStatus,
    output: String,
    error: Option<String>,
}

impl Branch {
    pub fn new(index: usize, iteration: u32, injection: &Injection) -> Self {
        Self {
            index,
            iteration,
            subject: injection.subject.clone(),
            injection: injection.text.clone(),
            status: BranchStatus::Pending,
            output: String::new(),
            error: None,
        }
    }

    pub fn status(&self) -> BranchStatus {
        self.status
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.status == BranchStatus::Complete
    }

    fn start(&mut self) {
        if self.status == BranchStatus::Pending {
            self.status = BranchStatus::Streaming;
        }
    }

    /// Append streamed text; ignored unless the branch is streaming
    fn push_chunk(&mut self, delta: &str) -> bool {
        if self.status != BranchStatus::Streaming {
            return false;
        }
        self.output.push_str(delta);
        true
    }

    fn complete(&mut self, fallback: Option<&str>) {
        if self.status.is_terminal() {
            return;
        }
        if self.output.is_empty()
            && let Some(text) = fallback
        {
            self.output.push_str(text);
        }
        self.status = BranchStatus::Complete;
    }

    fn fail(&mut self, message: String) {
        if self.status.is_terminal() {
            return;
        }
        self.error = Some(message);
        self.status = BranchStatus::Errored;
    }
}

/// Build the branch conversation: the last user message becomes the
/// skeleton with the injection substituted at the marker.
pub fn branch_conversation(conversation: &[Message], skeleton: &str, marker: &str, injection: &str) -> Vec<Message> {
    let prompt = skeleton.replacen(marker, injection, 1);
    let mut messages = conversation.to_vec();
    match messages.iter_mut().rev().find(|m| m.role == Role::User) {
        Some(last_user) => last_user.content = prompt,
        None => messages.push(Message::user(prompt)),
    }
    messages
}

#[derive(Serialize)]
struct BranchPromptContext<'a> {
    subject: &'a str,
    iteration: u32,
}

/// Runs branches against the gateway and reports them on the turn channel
pub struct BranchExecutor {
    gateway: Gateway,
    prompts: Arc<PromptLoader>,
    marker: String,
    timeout: Duration,
    max_tokens: u32,
}

impl BranchExecutor {
    pub fn new(gateway: Gateway, prompts: Arc<PromptLoader>, marker: String, timeout: Duration, max_tokens: u32) -> Self {
        debug!(%marker, ?timeout, max_tokens, "BranchExecutor::new: called");
        Self {
            gateway,
            prompts,
            marker,
            timeout,
            max_tokens,
        }
    }

    /// Run one batch concurrently and wait for every branch to finish
    ///
    /// Results come back in index order regardless of completion order.
    pub async fn run_batch(
        &self,
        iteration: u32,
        injections: &[Injection],
        skeleton: &str,
        conversation: &[Message],
        emitter: &TurnEmitter,
    ) -> Result<Vec<Branch>, ChannelError> {
        info!(iteration, branch_count = injections.len(), "Starting branch batch");
        let runs = injections
            .iter()
            .enumerate()
            .map(|(index, injection)| self.run(Branch::new(index, iteration, injection), skeleton, conversation, emitter));

        let branches = join_all(runs).await.into_iter().collect::<Result<Vec<_>, _>>()?;
        let succeeded = branches.iter().filter(|b| b.is_success()).count();
        info!(iteration, succeeded, failed = branches.len() - succeeded, "Branch batch finished");
        Ok(branches)
    }

    /// Run a single branch to a terminal status
    pub async fn run(
        &self,
        mut branch: Branch,
        skeleton: &str,
        conversation: &[Message],
        emitter: &TurnEmitter,
    ) -> Result<Branch, ChannelError> {
        debug!(index = branch.index, iteration = branch.iteration, subject = %branch.subject, "BranchExecutor::run: called");
        branch.start();
        emitter
            .stream_start(branch.index, &branch.subject, branch.iteration)
            .await?;

        let system_prompt = match self.prompts.render(
            "branch",
            &BranchPromptContext {
                subject: &branch.subject,
                iteration: branch.iteration,
            },
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                branch.fail(e.to_string());
                return self.report(branch, emitter).await;
            }
        };

        let request = CompletionRequest {
            system_prompt,
            messages: branch_conversation(conversation, skeleton, &self.marker, &branch.injection),
            max_tokens: self.max_tokens,
        };

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(64);
        let index = branch.index;
        let iteration = branch.iteration;

        let call = self.gateway.stream(request, self.timeout, chunk_tx);
        let forward = async {
            while let Some(chunk) = chunk_rx.recv().await {
                if let StreamChunk::TextDelta(delta) = chunk
                    && branch.push_chunk(&delta)
                {
                    emitter.content_chunk(index, iteration, &delta).await?;
                }
            }
            Ok::<(), ChannelError>(())
        };

        // Every chunk is forwarded before the terminal event goes out
        let (result, forwarded) = tokio::join!(call, forward);
        forwarded?;

        match result {
            Ok(response) => branch.complete(response.content.as_deref()),
            Err(e) => {
                warn!(index, iteration, error = %e, "Branch failed");
                branch.fail(describe_failure(&e));
            }
        }
        self.report(branch, emitter).await
    }

    async fn report(&self, branch: Branch, emitter: &TurnEmitter) -> Result<Branch, ChannelError> {
        match branch.status() {
            BranchStatus::Complete => {
                emitter
                    .stream_end(branch.index, &branch.subject, branch.iteration, branch.output())
                    .await?
            }
            _ => {
                let message = format!(
                    "Error in task {} ({}): {}",
                    branch.index,
                    branch.subject,
                    branch.error().unwrap_or("unknown error")
                );
                emitter.branch_error(branch.index, branch.iteration, &message).await?
            }
        }
        Ok(branch)
    }
}

fn describe_failure(error: &LlmError) -> String {
    match error {
        LlmError::Timeout(d) => format!("timed out after {}s", d.as_secs_f32()),
        LlmError::RateLimited { retry_after } => format!("rate limited, retry after {}s", retry_after.as_secs()),
        other => other.to_string(),
    }
}

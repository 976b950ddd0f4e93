//! Scripted in-memory LLM client shared by the integration tests
//!
//! Requests are routed on the header line of their system prompt, so every
//! phase of a turn can be scripted independently. Branch calls are matched
//! on their injection text, found in the last user message.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parallelchat::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, StreamChunk};
use parallelchat::{EventEnvelope, TurnEvent};
use tokio::sync::mpsc;

/// How one branch behaves
#[derive(Debug, Clone, Default)]
pub struct BranchScript {
    pub chunks: Vec<String>,
    /// Sleep before each chunk
    pub delay: Duration,
    /// Fail after sending the chunks
    pub fail: bool,
}

impl BranchScript {
    pub fn ok(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn slow(chunks: &[&str], delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            ..Self::ok(chunks)
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct ScriptedClient {
    pub decomposition: String,
    /// Injection text -> branch behavior
    pub branches: HashMap<String, BranchScript>,
    /// Replies to successive evaluation calls; once used up, "ready"
    pub evaluations: Mutex<Vec<String>>,
    pub rebranch: String,
    pub synthesis: Vec<String>,
    pub fail_synthesis: bool,
    /// System prompts of the synthesis calls received
    pub synthesis_prompts: Mutex<Vec<String>>,
    /// Calls received, any route
    pub calls: AtomicUsize,
    /// Branch streams dropped before their last chunk was sent
    pub cancelled_branches: AtomicUsize,
}

pub const READY: &str = "READY_FOR_SYNTHESIS: true\nEXPLANATION: Enough evidence.\n";

/// A well-formed decomposition with one injection per `(subject, text)`
pub fn decomposition(pairs: &[(&str, &str)]) -> String {
    let mut reply = String::from(
        "DECOMPOSITION_SUMMARY:\nEach option is researched on its own.\n\nPROMPT_SKELETON:\nGive a detailed analysis of [INJECTION_POINT].\n\n",
    );
    reply.push_str(&format!("INJECTION_COUNT: {}\n\n", pairs.len()));
    for (i, (subject, text)) in pairs.iter().enumerate() {
        reply.push_str(&format!("INJECTION_{}_SUBJECT: {}\nINJECTION_{}: {}\n\n", i + 1, subject, i + 1, text));
    }
    reply.push_str("SYNTHESIS_RECOMMENDATION: true\n");
    reply
}

impl ScriptedClient {
    pub fn new(decomposition: String) -> Self {
        Self {
            decomposition,
            synthesis: vec!["Final".to_string(), " answer".to_string()],
            ..Self::default()
        }
    }

    pub fn branch(mut self, injection: &str, script: BranchScript) -> Self {
        self.branches.insert(injection.to_string(), script);
        self
    }

    pub fn evaluations(self, replies: &[&str]) -> Self {
        if let Ok(mut evaluations) = self.evaluations.lock() {
            *evaluations = replies.iter().map(|r| r.to_string()).collect();
        }
        self
    }

    pub fn rebranch(mut self, reply: &str) -> Self {
        self.rebranch = reply.to_string();
        self
    }

    pub fn failing_synthesis(mut self) -> Self {
        self.fail_synthesis = true;
        self
    }

    fn route(request: &CompletionRequest) -> &'static str {
        let header = request.system_prompt.lines().next().unwrap_or("").trim();
        match header {
            "# Query Decomposition" => "decompose",
            "# Focused Research" => "branch",
            "# Solution Evaluation" => "evaluate",
            "# Rebranching" => "rebranch",
            "# Synthesis" => "synthesize",
            "# Response Comparison" => "judge",
            _ => "direct",
        }
    }

    fn record(&self, route: &str, request: &CompletionRequest) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if route == "synthesize"
            && let Ok(mut prompts) = self.synthesis_prompts.lock()
        {
            prompts.push(request.system_prompt.clone());
        }
    }

    fn branch_script(&self, request: &CompletionRequest) -> BranchScript {
        let prompt = request.last_user_text().unwrap_or("");
        self.branches
            .iter()
            .filter(|(injection, _)| prompt.contains(injection.as_str()))
            .max_by_key(|(injection, _)| injection.len())
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| BranchScript::ok(&["generic", " output"]))
    }

    fn next_evaluation(&self) -> String {
        match self.evaluations.lock() {
            Ok(mut evaluations) if !evaluations.is_empty() => evaluations.remove(0),
            _ => READY.to_string(),
        }
    }

    fn reply(&self, route: &str) -> Result<String, LlmError> {
        match route {
            "decompose" => Ok(self.decomposition.clone()),
            "evaluate" => Ok(self.next_evaluation()),
            "rebranch" => Ok(self.rebranch.clone()),
            "synthesize" if self.fail_synthesis => Err(LlmError::ApiError {
                status: 500,
                message: "synthesis exploded".to_string(),
            }),
            "synthesize" => Ok(self.synthesis.concat()),
            "judge" => Ok("BETTER: A\nREASONING: More thorough.".to_string()),
            _ => Ok("Direct answer".to_string()),
        }
    }
}

/// Counts a branch stream as cancelled if dropped while still armed
struct CancelGuard<'a> {
    counter: &'a AtomicUsize,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let route = Self::route(&request);
        self.record(route, &request);
        if route == "branch" {
            let script = self.branch_script(&request);
            if script.fail {
                return Err(LlmError::ApiError {
                    status: 500,
                    message: "branch exploded".to_string(),
                });
            }
            return Ok(CompletionResponse::text(script.chunks.concat()));
        }
        self.reply(route).map(CompletionResponse::text)
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        let route = Self::route(&request);
        self.record(route, &request);

        let (chunks, delay, fail) = if route == "branch" {
            let script = self.branch_script(&request);
            (script.chunks, script.delay, script.fail)
        } else if route == "synthesize" {
            (self.synthesis.clone(), Duration::ZERO, self.fail_synthesis)
        } else {
            (vec![self.reply(route)?], Duration::ZERO, false)
        };

        let mut guard = CancelGuard {
            counter: &self.cancelled_branches,
            armed: route == "branch",
        };
        for chunk in &chunks {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = chunk_tx.send(StreamChunk::TextDelta(chunk.clone())).await;
        }
        guard.armed = false;

        if fail {
            return Err(LlmError::ApiError {
                status: 500,
                message: format!("{} exploded", route),
            });
        }
        Ok(CompletionResponse::text(chunks.concat()))
    }
}

/// Event type names in emission order
pub fn types(events: &[EventEnvelope]) -> Vec<&'static str> {
    events.iter().map(|e| e.event.event_type()).collect()
}

/// Position of the first event matching `pred`
pub fn position(events: &[EventEnvelope], pred: impl Fn(&TurnEvent) -> bool) -> Option<usize> {
    events.iter().position(|e| pred(&e.event))
}

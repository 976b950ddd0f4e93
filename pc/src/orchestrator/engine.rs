//! Orchestrator - drives one turn through the phase machine
//!
//! The orchestrator task is the only owner of [`TurnState`]. Each phase's
//! async work is awaited to completion before the next transition, with a
//! join barrier over every branch of an iteration. A turn races against the
//! consumer going away; losing that race drops every in-flight gateway call.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::branch::BranchExecutor;
use super::decomposer::Decomposer;
use super::error::{StepError, TurnError};
use super::gateway::Gateway;
use super::rebrancher::{RebranchPolicy, Rebrancher, RoundCapPolicy};
use super::state::{Phase, TurnState};
use super::synthesizer::{Synthesizer, concatenate};
use crate::config::OrchestratorConfig;
use crate::events::{ChannelError, TurnEmitter};
use crate::llm::{LlmClient, Message};
use crate::prompts::PromptLoader;

/// Outcome of one turn, after its final event was emitted
#[derive(Debug, Clone)]
pub struct TurnSummary {
    pub sequence_id: Uuid,
    pub final_response: Option<String>,
    /// Branches run across all iterations
    pub task_count: usize,
    pub phases: Vec<Phase>,
    /// Set when the turn ended with a turn-scoped error event
    pub error: Option<String>,
}

impl TurnSummary {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.final_response.is_some()
    }
}

pub struct Orchestrator {
    gateway: Gateway,
    decomposer: Decomposer,
    executor: BranchExecutor,
    rebrancher: Rebrancher,
    synthesizer: Synthesizer,
}

impl Orchestrator {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: Arc<PromptLoader>, config: &OrchestratorConfig) -> Self {
        let policy = Arc::new(RoundCapPolicy::new(config.max_rebranch_rounds));
        Self::with_policy(llm, prompts, config, policy)
    }

    pub fn with_policy(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLoader>,
        config: &OrchestratorConfig,
        policy: Arc<dyn RebranchPolicy>,
    ) -> Self {
        debug!(?config, "Orchestrator::with_policy: called");
        let gateway = Gateway::new(llm, config.max_concurrent_calls);
        let max_branches = config.max_branches.max(1);

        Self {
            decomposer: Decomposer::new(
                gateway.clone(),
                prompts.clone(),
                config.injection_marker.clone(),
                max_branches,
                config.decompose_timeout(),
                config.control_max_tokens,
            ),
            executor: BranchExecutor::new(
                gateway.clone(),
                prompts.clone(),
                config.injection_marker.clone(),
                config.branch_timeout(),
                config.branch_max_tokens,
            ),
            rebrancher: Rebrancher::new(
                gateway.clone(),
                prompts.clone(),
                policy,
                max_branches,
                config.rebranch_timeout(),
                config.control_max_tokens,
            ),
            synthesizer: Synthesizer::new(
                gateway.clone(),
                prompts,
                config.stream_synthesis,
                config.synthesis_timeout(),
                config.control_max_tokens,
            ),
            gateway,
        }
    }

    /// Gateway shared by every phase, for callers issuing direct calls
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Run one turn to completion
    ///
    /// Handled failures (decomposition, all branches, synthesis) have already
    /// been reported on the channel and come back as `Ok` with
    /// `TurnSummary::error` set. `Err` means the turn was abandoned: the
    /// consumer disconnected or the phase machine was violated.
    pub async fn run_turn(&self, conversation: Vec<Message>, emitter: &TurnEmitter) -> Result<TurnSummary, TurnError> {
        debug!(
            sequence_id = %emitter.sequence_id(),
            message_count = conversation.len(),
            "Orchestrator::run_turn: called"
        );
        let mut state = TurnState::new(conversation);

        let outcome = tokio::select! {
            biased;
            _ = emitter.closed() => Err(TurnError::Channel(ChannelError::Disconnected)),
            result = self.drive(&mut state, emitter) => result,
        };

        let error = match outcome {
            Ok(()) => None,
            Err(e) if e.is_disconnect() => {
                warn!(
                    sequence_id = %emitter.sequence_id(),
                    phase = %state.phase(),
                    "Client disconnected, abandoning turn"
                );
                return Err(e);
            }
            Err(e @ TurnError::Transition(_)) => return Err(e),
            Err(e) => Some(e.to_string()),
        };

        let summary = TurnSummary {
            sequence_id: emitter.sequence_id(),
            final_response: state.final_response().map(str::to_string),
            task_count: state.total_branch_count(),
            phases: state.history().to_vec(),
            error,
        };
        info!(
            sequence_id = %summary.sequence_id,
            task_count = summary.task_count,
            success = summary.is_success(),
            "Turn finished"
        );
        Ok(summary)
    }

    async fn drive(&self, state: &mut TurnState, emitter: &TurnEmitter) -> Result<(), TurnError> {
        let Some(query) = state.query().map(str::to_string) else {
            state.transition(Phase::Fatal)?;
            emitter.turn_error("No user query found in messages").await?;
            state.transition(Phase::Complete)?;
            emitter.all_complete(0).await?;
            return Err(TurnError::EmptyConversation);
        };

        state.transition(Phase::Decomposing)?;
        let decomposition = match self.decomposer.decompose(state.conversation(), emitter).await {
            Ok(decomposition) => decomposition,
            Err(e) => {
                let err = TurnError::from_step(e, TurnError::Decompose);
                if err.is_disconnect() {
                    return Err(err);
                }
                warn!(error = %err, "Decomposition failed");
                state.transition(Phase::DecomposeFailed)?;
                return self.abort(state, emitter, err).await;
            }
        };

        let skeleton = decomposition.skeleton.clone();
        let synthesize = decomposition.synthesize;
        let mut injections = decomposition.injections.clone();
        state.set_decomposition(decomposition);

        let mut iteration = 0;
        state.transition(Phase::Branching { iteration })?;
        loop {
            let branches = self
                .executor
                .run_batch(iteration, &injections, &skeleton, state.conversation(), emitter)
                .await?;
            let failed = branches.iter().filter(|b| !b.is_success()).count();
            let succeeded = branches.len() - failed;
            state.record_branches(iteration, branches);

            if state.successful_count() == 0 {
                warn!(iteration, failed, "Every branch failed");
                state.transition(Phase::Fatal)?;
                let err = TurnError::AllBranchesFailed(state.total_branch_count());
                return self.abort(state, emitter, err).await;
            }
            if failed > 0 {
                state.transition(Phase::BranchFailed { iteration, failed })?;
            }

            if !self.rebrancher.should_evaluate(iteration, succeeded) {
                break;
            }
            state.transition(Phase::RebranchEvaluating { iteration })?;
            let round = self
                .rebrancher
                .next_round(iteration, &query, &skeleton, state.round_outputs(iteration), emitter)
                .await?;
            let Some(round) = round else {
                break;
            };

            injections = round.new_injections.clone();
            state.record_rebranch(round);
            iteration += 1;
            state.transition(Phase::Branching { iteration })?;
        }

        state.transition(Phase::Synthesizing)?;
        let outputs = state.successful_outputs();
        let answer = if synthesize {
            match self.synthesizer.synthesize(&query, outputs, emitter).await {
                Ok(answer) => answer,
                Err(StepError::Channel(e)) => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "Synthesis failed");
                    state.transition(Phase::Fatal)?;
                    return self.abort(state, emitter, TurnError::Synthesize(e)).await;
                }
            }
        } else {
            info!(branch_count = outputs.len(), "Synthesis not recommended, concatenating branch outputs");
            concatenate(&outputs)
        };

        emitter.final_response(&answer).await?;
        state.set_final_response(answer);
        state.transition(Phase::Complete)?;
        emitter.all_complete(state.total_branch_count()).await?;
        Ok(())
    }

    /// Report a turn-fatal failure and close the turn
    async fn abort(&self, state: &mut TurnState, emitter: &TurnEmitter, err: TurnError) -> Result<(), TurnError> {
        emitter.turn_error(&format!("Error processing query: {}", err)).await?;
        state.transition(Phase::Complete)?;
        emitter.all_complete(state.total_branch_count()).await?;
        Err(err)
    }
}

//! Rebrancher - decides whether another round of branches is worth running
//!
//! Two model calls per round: an evaluation of the latest results, then
//! (only if the policy agrees) a rebranch call producing new injections for
//! the turn's skeleton. Neither failure is fatal to the turn.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::StepError;
use super::gateway::Gateway;
use super::parser::{Evaluation, RebranchResult, parse_evaluation, parse_rebranch};
use crate::events::{ChannelError, TurnEmitter};
use crate::llm::{CompletionRequest, Message};
use crate::prompts::{PromptLoader, RebranchContext, ResultsContext, SubjectOutput};

/// Decides when rebranching stops
pub trait RebranchPolicy: Send + Sync {
    /// Whether to evaluate the results of the round just finished
    fn should_evaluate(&self, completed_rounds: u32, successful_branches: usize) -> bool;

    /// Whether the evaluation justifies another round
    fn should_rebranch(&self, completed_rounds: u32, evaluation: &Evaluation) -> bool;
}

/// Rebranch at most `max_rounds` times, and only when the model names
/// promising paths and says the results are not ready yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundCapPolicy {
    pub max_rounds: u32,
}

impl RoundCapPolicy {
    pub fn new(max_rounds: u32) -> Self {
        Self { max_rounds }
    }
}

impl RebranchPolicy for RoundCapPolicy {
    fn should_evaluate(&self, completed_rounds: u32, successful_branches: usize) -> bool {
        completed_rounds < self.max_rounds && successful_branches > 0
    }

    fn should_rebranch(&self, completed_rounds: u32, evaluation: &Evaluation) -> bool {
        completed_rounds < self.max_rounds && !evaluation.ready_for_synthesis && !evaluation.promising_paths.is_empty()
    }
}

pub struct Rebrancher {
    gateway: Gateway,
    prompts: Arc<PromptLoader>,
    policy: Arc<dyn RebranchPolicy>,
    max_branches: usize,
    timeout: Duration,
    max_tokens: u32,
}

impl Rebrancher {
    pub fn new(
        gateway: Gateway,
        prompts: Arc<PromptLoader>,
        policy: Arc<dyn RebranchPolicy>,
        max_branches: usize,
        timeout: Duration,
        max_tokens: u32,
    ) -> Self {
        debug!(max_branches, ?timeout, "Rebrancher::new: called");
        Self {
            gateway,
            prompts,
            policy,
            max_branches,
            timeout,
            max_tokens,
        }
    }

    pub fn should_evaluate(&self, completed_rounds: u32, successful_branches: usize) -> bool {
        self.policy.should_evaluate(completed_rounds, successful_branches)
    }

    /// Evaluate round `iteration` and, if warranted, plan round `iteration + 1`
    ///
    /// `None` means "no further rounds". Only a lost channel is an error.
    pub async fn next_round(
        &self,
        iteration: u32,
        query: &str,
        skeleton: &str,
        results: Vec<SubjectOutput>,
        emitter: &TurnEmitter,
    ) -> Result<Option<RebranchResult>, ChannelError> {
        debug!(iteration, result_count = results.len(), "Rebrancher::next_round: called");

        let evaluation = match self.evaluate(query, &results).await {
            Ok(evaluation) => evaluation,
            Err(StepError::Channel(e)) => return Err(e),
            Err(e) => {
                warn!(iteration, error = %e, "Evaluation failed, proceeding to synthesis");
                return Ok(None);
            }
        };

        if !self.policy.should_rebranch(iteration, &evaluation) {
            info!(iteration, ready = evaluation.ready_for_synthesis, "No further rebranching");
            return Ok(None);
        }

        let next = iteration + 1;
        let paths = evaluation.promising_paths;
        emitter
            .rebranch_start(
                &format!("Exploring {} promising paths...", paths.len()),
                next,
                paths.clone(),
            )
            .await?;

        let context = RebranchContext {
            query: query.to_string(),
            skeleton: skeleton.to_string(),
            results,
            promising_paths: paths.clone(),
            max_branches: self.max_branches,
        };
        match self.rebranch(next, &paths, &context).await {
            Ok(result) => {
                emitter.rebranch_end(&result.rationale, next, result.subjects()).await?;
                if result.new_injections.is_empty() {
                    info!(iteration = next, "Rebranch produced no new injections");
                    return Ok(None);
                }
                info!(iteration = next, injection_count = result.new_injections.len(), "Rebranch round planned");
                Ok(Some(result))
            }
            Err(StepError::Channel(e)) => Err(e),
            Err(e) => {
                warn!(iteration = next, error = %e, "Rebranch failed, proceeding to synthesis");
                emitter
                    .rebranch_end("Rebranching failed; continuing with current results", next, Vec::new())
                    .await?;
                Ok(None)
            }
        }
    }

    async fn evaluate(&self, query: &str, results: &[SubjectOutput]) -> Result<Evaluation, StepError> {
        let system_prompt = self
            .prompts
            .render(
                "evaluate",
                &ResultsContext {
                    query: query.to_string(),
                    results: results.to_vec(),
                },
            )
            .map_err(|e| StepError::Prompt(e.to_string()))?;

        let response = self
            .gateway
            .complete(
                CompletionRequest {
                    system_prompt,
                    messages: vec![Message::user(query)],
                    max_tokens: self.max_tokens,
                },
                self.timeout,
            )
            .await?;
        Ok(parse_evaluation(response.text_or_empty())?)
    }

    async fn rebranch(
        &self,
        iteration: u32,
        paths: &[String],
        context: &RebranchContext,
    ) -> Result<RebranchResult, StepError> {
        let system_prompt = self
            .prompts
            .render("rebranch", context)
            .map_err(|e| StepError::Prompt(e.to_string()))?;

        let response = self
            .gateway
            .complete(
                CompletionRequest {
                    system_prompt,
                    messages: vec![Message::user(context.query.clone())],
                    max_tokens: self.max_tokens,
                },
                self.timeout,
            )
            .await?;
        Ok(parse_rebranch(response.text_or_empty(), iteration, paths, self.max_branches)?)
    }
}

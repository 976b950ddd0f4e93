//! Turn state machine
//!
//! ```text
//! Idle -> Decomposing -> Branching(0) -> [RebranchEvaluating(k) -> Branching(k+1)]* -> Synthesizing -> Complete
//!              |              |
//!              v              +-> BranchFailed(partial) -> RebranchEvaluating | Synthesizing
//!       DecomposeFailed       +-> Fatal -> Complete
//!              |
//!              v
//!          Complete
//!
//! Idle -> Fatal -> Complete    (no user message to answer)
//! ```
//!
//! `TurnState` is owned by the orchestrator task alone. Branch results come
//! back as return values and are recorded here after the join barrier.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::branch::Branch;
use super::parser::{DecompositionResult, RebranchResult};
use crate::llm::{Message, Role};
use crate::prompts::SubjectOutput;

/// Orchestration phase of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Decomposing,
    Branching { iteration: u32 },
    RebranchEvaluating { iteration: u32 },
    Synthesizing,
    Complete,
    DecomposeFailed,
    /// Some branches of the iteration errored, at least one succeeded somewhere in the turn
    BranchFailed { iteration: u32, failed: usize },
    Fatal,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Decomposing => write!(f, "decomposing"),
            Phase::Branching { iteration } => write!(f, "branching({})", iteration),
            Phase::RebranchEvaluating { iteration } => write!(f, "rebranch_evaluating({})", iteration),
            Phase::Synthesizing => write!(f, "synthesizing"),
            Phase::Complete => write!(f, "complete"),
            Phase::DecomposeFailed => write!(f, "decompose_failed"),
            Phase::BranchFailed { iteration, failed } => write!(f, "branch_failed({}, {} failed)", iteration, failed),
            Phase::Fatal => write!(f, "fatal"),
        }
    }
}

impl Phase {
    /// Whether the machine may move from `self` to `next`
    pub fn can_transition_to(&self, next: &Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Idle, Decomposing) | (Idle, Fatal) => true,
            (Decomposing, Branching { iteration: 0 }) | (Decomposing, DecomposeFailed) => true,
            (Branching { iteration: a }, RebranchEvaluating { iteration: b }) => a == b,
            (Branching { iteration: a }, BranchFailed { iteration: b, .. }) => a == b,
            (Branching { .. }, Synthesizing) | (Branching { .. }, Fatal) => true,
            (BranchFailed { iteration: a, .. }, RebranchEvaluating { iteration: b }) => a == b,
            (BranchFailed { .. }, Synthesizing) => true,
            (RebranchEvaluating { iteration: a }, Branching { iteration: b }) => *b == a + 1,
            (RebranchEvaluating { .. }, Synthesizing) => true,
            (Synthesizing, Complete) | (Synthesizing, Fatal) => true,
            (DecomposeFailed, Complete) | (Fatal, Complete) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Phase::Complete
    }

    /// Branch results are only accepted while branching
    pub fn accepts_branch_results(&self) -> bool {
        matches!(self, Phase::Branching { .. })
    }
}

/// Attempted an illegal phase change
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid phase transition from {from} to {to}")]
pub struct TransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Everything the orchestrator knows about the turn in flight
#[derive(Debug, Clone)]
pub struct TurnState {
    conversation: Vec<Message>,
    decomposition: Option<DecompositionResult>,
    branches_by_iteration: BTreeMap<u32, Vec<Branch>>,
    rebranches: Vec<RebranchResult>,
    final_response: Option<String>,
    phase: Phase,
    history: Vec<Phase>,
}

impl TurnState {
    pub fn new(conversation: Vec<Message>) -> Self {
        debug!(message_count = conversation.len(), "TurnState::new: called");
        Self {
            conversation,
            decomposition: None,
            branches_by_iteration: BTreeMap::new(),
            rebranches: Vec::new(),
            final_response: None,
            phase: Phase::Idle,
            history: vec![Phase::Idle],
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Every phase visited, in order
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    /// The query this turn answers: the last user message
    pub fn query(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .filter(|q| !q.trim().is_empty())
    }

    pub fn decomposition(&self) -> Option<&DecompositionResult> {
        self.decomposition.as_ref()
    }

    pub fn final_response(&self) -> Option<&str> {
        self.final_response.as_deref()
    }

    pub fn rebranches(&self) -> &[RebranchResult] {
        &self.rebranches
    }

    pub fn transition(&mut self, next: Phase) -> Result<(), TransitionError> {
        if !self.phase.can_transition_to(&next) {
            return Err(TransitionError {
                from: self.phase,
                to: next,
            });
        }
        info!(from = %self.phase, to = %next, "Turn phase transition");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }

    pub fn set_decomposition(&mut self, decomposition: DecompositionResult) {
        self.decomposition = Some(decomposition);
    }

    pub fn record_rebranch(&mut self, rebranch: RebranchResult) {
        self.rebranches.push(rebranch);
    }

    pub fn set_final_response(&mut self, text: String) {
        self.final_response = Some(text);
    }

    /// Record a finished batch; returns how many branches were accepted
    ///
    /// Results arriving outside a branching phase (after synthesis started,
    /// or once the turn is complete) are discarded with a warning. So are
    /// batches whose `(iteration, index)` pairs collide with recorded ones
    /// or whose indices are not dense from zero.
    pub fn record_branches(&mut self, iteration: u32, branches: Vec<Branch>) -> usize {
        if !self.phase.accepts_branch_results() {
            warn!(phase = %self.phase, iteration, count = branches.len(), "Discarding late branch results");
            return 0;
        }
        if self.branches_by_iteration.contains_key(&iteration) {
            warn!(iteration, "Discarding duplicate branch batch");
            return 0;
        }
        let dense = branches
            .iter()
            .enumerate()
            .all(|(i, b)| b.index == i && b.iteration == iteration && b.status().is_terminal());
        if !dense {
            warn!(iteration, "Discarding malformed branch batch");
            return 0;
        }

        let count = branches.len();
        self.branches_by_iteration.insert(iteration, branches);
        count
    }

    pub fn branches(&self, iteration: u32) -> &[Branch] {
        self.branches_by_iteration
            .get(&iteration)
            .map(|b| b.as_slice())
            .unwrap_or(&[])
    }

    /// Branches run across all iterations
    pub fn total_branch_count(&self) -> usize {
        self.branches_by_iteration.values().map(|b| b.len()).sum()
    }

    pub fn successful_count(&self) -> usize {
        self.branches_by_iteration
            .values()
            .flatten()
            .filter(|b| b.is_success())
            .count()
    }

    /// Subject-labelled outputs of successful branches in one iteration
    pub fn round_outputs(&self, iteration: u32) -> Vec<SubjectOutput> {
        self.branches(iteration)
            .iter()
            .filter(|b| b.is_success())
            .map(to_subject_output)
            .collect()
    }

    /// Subject-labelled outputs of successful branches across all iterations
    pub fn successful_outputs(&self) -> Vec<SubjectOutput> {
        self.branches_by_iteration
            .values()
            .flatten()
            .filter(|b| b.is_success())
            .map(to_subject_output)
            .collect()
    }
}

fn to_subject_output(branch: &Branch) -> SubjectOutput {
    SubjectOutput {
        subject: branch.subject.clone(),
        output: branch.output().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = TurnState::new(vec![Message::user("q")]);
        state.transition(Phase::Decomposing).unwrap();
        state.transition(Phase::Branching { iteration: 0 }).unwrap();
        state.transition(Phase::RebranchEvaluating { iteration: 0 }).unwrap();
        state.transition(Phase::Branching { iteration: 1 }).unwrap();
        state.transition(Phase::Synthesizing).unwrap();
        state.transition(Phase::Complete).unwrap();

        assert!(state.phase().is_terminal());
        assert_eq!(state.history().len(), 7);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut state = TurnState::new(vec![]);
        let err = state.transition(Phase::Synthesizing).unwrap_err();
        assert_eq!(err.from, Phase::Idle);
        assert_eq!(err.to, Phase::Synthesizing);

        state.transition(Phase::Decomposing).unwrap();
        assert!(state.transition(Phase::Branching { iteration: 1 }).is_err());
        state.transition(Phase::Branching { iteration: 0 }).unwrap();
        assert!(state.transition(Phase::RebranchEvaluating { iteration: 3 }).is_err());
    }

    #[test]
    fn test_complete_is_terminal() {
        for next in [
            Phase::Idle,
            Phase::Decomposing,
            Phase::Branching { iteration: 0 },
            Phase::Synthesizing,
            Phase::Fatal,
        ] {
            assert!(!Phase::Complete.can_transition_to(&next));
        }
    }

    #[test]
    fn test_failure_paths() {
        assert!(Phase::Decomposing.can_transition_to(&Phase::DecomposeFailed));
        assert!(Phase::DecomposeFailed.can_transition_to(&Phase::Complete));
        assert!(Phase::Branching { iteration: 0 }.can_transition_to(&Phase::Fatal));
        assert!(
            Phase::Branching { iteration: 0 }.can_transition_to(&Phase::BranchFailed {
                iteration: 0,
                failed: 1
            })
        );
        assert!(Phase::BranchFailed { iteration: 0, failed: 1 }.can_transition_to(&Phase::Synthesizing));
        assert!(Phase::Fatal.can_transition_to(&Phase::Complete));
        assert!(Phase::Idle.can_transition_to(&Phase::Fatal));
        assert!(!Phase::Idle.can_transition_to(&Phase::Complete));
        assert!(!Phase::DecomposeFailed.can_transition_to(&Phase::Branching { iteration: 0 }));
    }

    #[test]
    fn test_query_is_last_user_message() {
        let state = TurnState::new(vec![Message::user("old"), Message::assistant("a"), Message::user("new")]);
        assert_eq!(state.query(), Some("new"));
        assert_eq!(TurnState::new(vec![Message::assistant("a")]).query(), None);
        assert_eq!(TurnState::new(vec![Message::user("  ")]).query(), None);
    }

    #[test]
    fn test_record_branches_outside_branching_is_discarded() {
        let mut state = TurnState::new(vec![Message::user("q")]);
        assert_eq!(state.record_branches(0, vec![]), 0);
        assert_eq!(state.total_branch_count(), 0);
    }
}

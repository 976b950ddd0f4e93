//! Parallel turn orchestration
//!
//! A turn decomposes the query into a skeleton prompt plus injections, runs
//! one branch per injection concurrently, optionally rebranches on the most
//! promising paths, then synthesizes a single answer.
//!
//! ```text
//!   Decomposer ──> BranchExecutor x N ──join──> Rebrancher ──┐
//!                        ^                                     │ new injections
//!                        └─────────────────────────────────────┘
//!                                     │ no further rounds
//!                                     v
//!                                Synthesizer ──> final_response, metadata
//! ```

mod branch;
mod decomposer;
mod engine;
mod error;
mod gateway;
pub mod parser;
mod rebrancher;
mod state;
mod synthesizer;

pub use branch::{Branch, BranchExecutor, BranchStatus, branch_conversation};
pub use decomposer::Decomposer;
pub use engine::{Orchestrator, TurnSummary};
pub use error::{StepError, TurnError};
pub use gateway::Gateway;
pub use parser::{
    DecompositionResult, Evaluation, Injection, ParseError, RebranchResult, Verdict, parse_decomposition,
    parse_evaluation, parse_rebranch, parse_verdict,
};
pub use rebrancher::{RebranchPolicy, Rebrancher, RoundCapPolicy};
pub use state::{Phase, TransitionError, TurnState};
pub use synthesizer::{Synthesizer, concatenate};

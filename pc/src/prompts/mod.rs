//! Prompt Template System
//!
//! Loads and renders `.pmt` (prompt template) files for each orchestration phase.
//!
//! Template loading chain:
//! 1. `<prompts-dir>/{name}.pmt` (configured override)
//! 2. Embedded fallback in code
//!
//! Templates use Handlebars syntax for variable substitution.

pub mod embedded;
mod loader;

pub use loader::{
    DecomposeContext, GenerateContext, JudgeContext, PromptLoader, RebranchContext, ResultsContext, SubjectOutput,
};

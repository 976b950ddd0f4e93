//! Embedded prompts
//!
//! These are compiled into the binary from .pmt files at build time.

use tracing::debug;

/// Decomposer instruction
pub const DECOMPOSE: &str = include_str!("../../prompts/decompose.pmt");

/// System prompt shared by every branch
pub const BRANCH: &str = include_str!("../../prompts/branch.pmt");

/// Evaluation of branch results before rebranching
pub const EVALUATE: &str = include_str!("../../prompts/evaluate.pmt");

/// New injections for promising paths
pub const REBRANCH: &str = include_str!("../../prompts/rebranch.pmt");

/// Synthesizer instruction
pub const SYNTHESIZE: &str = include_str!("../../prompts/synthesize.pmt");

/// Eval harness judge
pub const JUDGE: &str = include_str!("../../prompts/judge.pmt");

/// Eval question generator
pub const GENERATE: &str = include_str!("../../prompts/generate.pmt");

/// Names of every embedded template, in pipeline order
pub const NAMES: &[&str] = &["decompose", "branch", "evaluate", "rebranch", "synthesize", "judge", "generate"];

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "decompose" => Some(DECOMPOSE),
        "branch" => Some(BRANCH),
        "evaluate" => Some(EVALUATE),
        "rebranch" => Some(REBRANCH),
        "synthesize" => Some(SYNTHESIZE),
        "judge" => Some(JUDGE),
        "generate" => Some(GENERATE),
        _ => {
            debug!("get_embedded: no match found");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_name_is_embedded() {
        for name in NAMES {
            assert!(get_embedded(name).is_some(), "missing embedded prompt {}", name);
        }
    }

    #[test]
    fn test_decompose_documents_sections() {
        let decompose = get_embedded("decompose").unwrap();
        assert!(decompose.starts_with("# Query Decomposition"));
        assert!(decompose.contains("DECOMPOSITION_SUMMARY:"));
        assert!(decompose.contains("PROMPT_SKELETON:"));
        assert!(decompose.contains("INJECTION_COUNT:"));
        assert!(decompose.contains("SYNTHESIS_RECOMMENDATION:"));
    }

    #[test]
    fn test_evaluate_documents_sections() {
        let evaluate = get_embedded("evaluate").unwrap();
        assert!(evaluate.contains("READY_FOR_SYNTHESIS:"));
        assert!(evaluate.contains("PROMISING_PATHS:"));
    }

    #[test]
    fn test_get_embedded_unknown() {
        assert!(get_embedded("unknown-template").is_none());
    }
}

//! Prompt Loader
//!
//! Loads prompt templates from files or falls back to embedded defaults.

use std::path::{Path, PathBuf};

use eyre::{Result, eyre};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use super::embedded;

/// Context for the decomposition prompt
#[derive(Debug, Clone, Serialize)]
pub struct DecomposeContext {
    pub query: String,
    pub marker: String,
    pub max_branches: usize,
}

/// One subject-labelled branch output
#[derive(Debug, Clone, Serialize)]
pub struct SubjectOutput {
    pub subject: String,
    pub output: String,
}

/// Context for prompts that review branch results (evaluate, synthesize)
#[derive(Debug, Clone, Serialize)]
pub struct ResultsContext {
    pub query: String,
    pub results: Vec<SubjectOutput>,
}

/// Context for the rebranch prompt
#[derive(Debug, Clone, Serialize)]
pub struct RebranchContext {
    pub query: String,
    pub skeleton: String,
    pub results: Vec<SubjectOutput>,
    pub promising_paths: Vec<String>,
    pub max_branches: usize,
}

/// Context for the eval judge prompt
#[derive(Debug, Clone, Serialize)]
pub struct JudgeContext {
    pub question: String,
    pub response_a: String,
    pub response_b: String,
}

/// Context for the eval question generator
#[derive(Debug, Clone, Serialize)]
pub struct GenerateContext {
    /// Openings of questions generated so far
    pub previous: Vec<String>,
}

/// Loads and renders prompt templates
pub struct PromptLoader {
    /// Handlebars template engine
    hbs: Handlebars<'static>,
    /// Override directory (e.g., `~/.config/parallelchat/prompts/`)
    override_dir: Option<PathBuf>,
}

impl PromptLoader {
    /// Create a prompt loader that checks `dir` before the embedded defaults
    pub fn new(dir: Option<impl AsRef<Path>>) -> Self {
        let override_dir = dir.map(|d| d.as_ref().to_path_buf()).filter(|d| d.exists());
        debug!(?override_dir, "PromptLoader::new: called");
        Self {
            hbs: Self::engine(),
            override_dir,
        }
    }

    /// Create a loader that only uses embedded prompts
    pub fn embedded_only() -> Self {
        debug!("PromptLoader::embedded_only: called");
        Self {
            hbs: Self::engine(),
            override_dir: None,
        }
    }

    fn engine() -> Handlebars<'static> {
        let mut hbs = Handlebars::new();
        // Prompts are plain text, not HTML
        hbs.register_escape_fn(handlebars::no_escape);
        hbs
    }

    /// Load a template by name
    ///
    /// Checks the override directory first, then the embedded fallback.
    pub fn load_template(&self, name: &str) -> Result<String> {
        debug!(%name, "PromptLoader::load_template: called");
        if let Some(ref dir) = self.override_dir {
            let path = dir.join(format!("{}.pmt", name));
            if path.exists() {
                debug!(?path, "PromptLoader::load_template: found override");
                return std::fs::read_to_string(&path)
                    .map_err(|e| eyre!("Failed to read prompt {}: {}", path.display(), e));
            }
            debug!(?path, "PromptLoader::load_template: no override");
        }

        if let Some(content) = embedded::get_embedded(name) {
            debug!(%name, "PromptLoader::load_template: found in embedded");
            return Ok(content.to_string());
        }

        Err(eyre!("Prompt template not found: {}", name))
    }

    /// Render a template with the given context
    pub fn render<T: Serialize>(&self, template_name: &str, context: &T) -> Result<String> {
        debug!(%template_name, "PromptLoader::render: called");
        let template = self.load_template(template_name)?;
        self.hbs
            .render_template(&template, context)
            .map_err(|e| eyre!("Failed to render template {}: {}", template_name, e))
    }

    /// Check every known template loads and renders with empty data
    pub fn verify(&self) -> Result<()> {
        for name in embedded::NAMES {
            self.render(name, &serde_json::json!({}))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_decompose_substitutes_marker() {
        let loader = PromptLoader::embedded_only();
        let ctx = DecomposeContext {
            query: "Compare Rust & Go".to_string(),
            marker: "[INJECTION_POINT]".to_string(),
            max_branches: 3,
        };

        let prompt = loader.render("decompose", &ctx).unwrap();
        assert!(prompt.contains("[INJECTION_POINT]"));
        assert!(prompt.contains("at most 3 injections"));
        // no HTML escaping
        assert!(prompt.contains("Compare Rust & Go"));
    }

    #[test]
    fn test_render_synthesize_lists_results() {
        let loader = PromptLoader::embedded_only();
        let ctx = ResultsContext {
            query: "Q".to_string(),
            results: vec![
                SubjectOutput {
                    subject: "Angle: X".to_string(),
                    output: "x facts".to_string(),
                },
                SubjectOutput {
                    subject: "Angle: Y".to_string(),
                    output: "y facts".to_string(),
                },
            ],
        };

        let prompt = loader.render("synthesize", &ctx).unwrap();
        assert!(prompt.starts_with("# Synthesis"));
        assert!(prompt.contains("### Angle: X\nx facts"));
        assert!(prompt.contains("### Angle: Y\ny facts"));
    }

    #[test]
    fn test_override_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("branch.pmt"), "custom {{query}}").unwrap();

        let loader = PromptLoader::new(Some(dir.path()));
        let prompt = loader.render("branch", &serde_json::json!({"query": "q"})).unwrap();
        assert_eq!(prompt, "custom q");

        // Templates without an override still come from the embedded set
        assert!(loader.load_template("judge").unwrap().contains("BETTER:"));
    }

    #[test]
    fn test_missing_dir_falls_back() {
        let loader = PromptLoader::new(Some("/nonexistent/prompts"));
        assert!(loader.verify().is_ok());
    }

    #[test]
    fn test_prompt_loader_unknown_template() {
        let loader = PromptLoader::embedded_only();
        assert!(loader.load_template("nonexistent-template").is_err());
    }
}

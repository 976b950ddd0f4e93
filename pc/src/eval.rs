//! Evaluation harness
//!
//! Runs each question twice, concurrently: once through a full orchestrated
//! turn (Model A) and once as a single direct gateway call (Model B). A judge
//! call then picks the better answer. Questions come from a YAML file, the
//! built-in set, or the model itself.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::events::channel;
use crate::llm::{CompletionRequest, Message};
use crate::orchestrator::{Orchestrator, Verdict, parse_verdict};
use crate::prompts::{GenerateContext, JudgeContext, PromptLoader};

pub const MODEL_A: &str = "Model A";
pub const MODEL_B: &str = "Model B";

/// Category of model-written questions
pub const GENERATED_CATEGORY: &str = "Best of N";

/// Characters of each generated question shown back to the generator
const OPENING_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalQuestion {
    pub id: String,
    pub category: String,
    pub question: String,
}

impl EvalQuestion {
    fn new(id: &str, category: &str, question: &str) -> Self {
        Self {
            id: id.to_string(),
            category: category.to_string(),
            question: question.to_string(),
        }
    }
}

/// Default question set
pub fn builtin_questions() -> Vec<EvalQuestion> {
    vec![
        EvalQuestion::new(
            "tech-relocation",
            "Best of N",
            "Which city should our tech company relocate to, considering talent availability, cost of living, tax incentives, and quality of life?",
        ),
        EvalQuestion::new(
            "microservices",
            "Best of N",
            "Should our software team adopt microservices or maintain a monolithic architecture for our growing application?",
        ),
        EvalQuestion::new(
            "startup-budget",
            "Uncertainty",
            "How should we allocate our startup's marketing budget with limited market data?",
        ),
        EvalQuestion::new(
            "autonomous-vehicles",
            "Ethics",
            "How should autonomous vehicles be programmed to handle unavoidable accident scenarios?",
        ),
        EvalQuestion::new(
            "ubi-effects",
            "Systems",
            "How might implementing a universal basic income affect economic, social, and political systems?",
        ),
        EvalQuestion::new(
            "remote-work",
            "Innovation",
            "How could we reimagine remote work tools to foster creativity and spontaneous collaboration?",
        ),
    ]
}

/// Load a YAML list of questions
pub fn load_questions(path: &Path) -> Result<Vec<EvalQuestion>> {
    debug!(?path, "load_questions: called");
    let content = std::fs::read_to_string(path).context(format!("Failed to read questions file: {}", path.display()))?;
    let questions: Vec<EvalQuestion> =
        serde_yaml::from_str(&content).context(format!("Failed to parse questions file: {}", path.display()))?;
    if questions.is_empty() {
        return Err(eyre!("Questions file is empty: {}", path.display()));
    }
    Ok(questions)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub model_id: String,
    pub response: String,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub question_id: String,
    pub responses: Vec<ModelResponse>,
    /// `None` on a tie
    pub better_response_model_id: Option<String>,
    pub faster_response_model_id: String,
    pub evaluator_reasoning: String,
}

impl EvalResult {
    fn latency(&self, model_id: &str) -> f64 {
        self.responses
            .iter()
            .find(|r| r.model_id == model_id)
            .map(|r| r.latency_ms)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalSummary {
    pub total_questions: usize,
    pub model_a_better_count: usize,
    pub model_b_better_count: usize,
    pub tie_count: usize,
    pub model_a_faster_count: usize,
    pub model_b_faster_count: usize,
    pub average_latency_a: f64,
    pub average_latency_b: f64,
}

impl EvalSummary {
    pub fn from_results(results: &[EvalResult]) -> Self {
        let mut summary = Self {
            total_questions: results.len(),
            ..Self::default()
        };
        if results.is_empty() {
            return summary;
        }

        let (mut total_a, mut total_b) = (0.0, 0.0);
        for result in results {
            match result.better_response_model_id.as_deref() {
                Some(MODEL_A) => summary.model_a_better_count += 1,
                Some(MODEL_B) => summary.model_b_better_count += 1,
                _ => summary.tie_count += 1,
            }
            if result.faster_response_model_id == MODEL_A {
                summary.model_a_faster_count += 1;
            } else {
                summary.model_b_faster_count += 1;
            }
            total_a += result.latency(MODEL_A);
            total_b += result.latency(MODEL_B);
        }

        summary.average_latency_a = total_a / results.len() as f64;
        summary.average_latency_b = total_b / results.len() as f64;
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSession {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub results: Vec<EvalResult>,
    pub summary: EvalSummary,
}

pub struct EvalRunner {
    orchestrator: Arc<Orchestrator>,
    prompts: Arc<PromptLoader>,
    timeout: Duration,
    max_tokens: u32,
}

impl EvalRunner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        prompts: Arc<PromptLoader>,
        timeout: Duration,
        max_tokens: u32,
    ) -> Self {
        Self {
            orchestrator,
            prompts,
            timeout,
            max_tokens,
        }
    }

    /// Run every question in order; failed questions are logged and skipped
    pub async fn run(&self, questions: &[EvalQuestion]) -> EvalSession {
        let started = Utc::now();
        info!(question_count = questions.len(), "Starting evaluation");

        let mut results = Vec::new();
        for question in questions {
            match self.run_question(question).await {
                Ok(result) => results.push(result),
                Err(e) => warn!(question_id = %question.id, error = %e, "Question failed, skipping"),
            }
        }

        let summary = EvalSummary::from_results(&results);
        info!(?summary, "Evaluation finished");
        EvalSession {
            id: started.timestamp().to_string(),
            timestamp: started,
            results,
            summary,
        }
    }

    pub async fn run_question(&self, question: &EvalQuestion) -> Result<EvalResult> {
        debug!(question_id = %question.id, "EvalRunner::run_question: called");
        let (a, b) = tokio::join!(self.answer_parallel(&question.question), self.answer_direct(&question.question));
        let (a, b) = (a?, b?);

        let (verdict, reasoning) = self.judge(&question.question, &a.response, &b.response).await?;
        let better = match verdict {
            Verdict::A => Some(MODEL_A.to_string()),
            Verdict::B => Some(MODEL_B.to_string()),
            Verdict::Tie => None,
        };
        let faster = if a.latency_ms < b.latency_ms { MODEL_A } else { MODEL_B };

        Ok(EvalResult {
            question_id: question.id.clone(),
            responses: vec![a, b],
            better_response_model_id: better,
            faster_response_model_id: faster.to_string(),
            evaluator_reasoning: reasoning,
        })
    }

    async fn answer_parallel(&self, question: &str) -> Result<ModelResponse> {
        let started = Instant::now();
        let (emitter, mut rx) = channel(256);
        let drain = async move { while rx.recv().await.is_some() {} };
        let turn = async {
            let summary = self.orchestrator.run_turn(vec![Message::user(question)], &emitter).await;
            drop(emitter);
            summary
        };
        let (summary, ()) = tokio::join!(turn, drain);

        let summary = summary.map_err(|e| eyre!("Orchestrated turn abandoned: {}", e))?;
        let response = match (summary.final_response, summary.error) {
            (Some(text), _) => text,
            (None, Some(error)) => return Err(eyre!("Orchestrated turn failed: {}", error)),
            (None, None) => return Err(eyre!("Orchestrated turn produced no answer")),
        };
        Ok(ModelResponse {
            model_id: MODEL_A.to_string(),
            response,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        })
    }

    async fn answer_direct(&self, question: &str) -> Result<ModelResponse> {
        let started = Instant::now();
        let request = CompletionRequest {
            system_prompt: String::new(),
            messages: vec![Message::user(question)],
            max_tokens: self.max_tokens,
        };
        let response = self
            .orchestrator
            .gateway()
            .complete(request, self.timeout)
            .await
            .context("Direct model call failed")?;
        Ok(ModelResponse {
            model_id: MODEL_B.to_string(),
            response: response.text_or_empty().to_string(),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            timestamp: Utc::now(),
        })
    }

    /// Have the model write `count` business questions, one call each
    ///
    /// Every call sees the openings of the questions written so far so the set
    /// stays varied. Any failed or empty call fails the whole batch.
    pub async fn generate_questions(&self, count: usize) -> Result<Vec<EvalQuestion>> {
        debug!(count, "EvalRunner::generate_questions: called");
        let mut questions = Vec::with_capacity(count);
        let mut previous = Vec::with_capacity(count);

        for n in 1..=count {
            let system_prompt = self.prompts.render(
                "generate",
                &GenerateContext {
                    previous: previous.clone(),
                },
            )?;
            let request = CompletionRequest {
                system_prompt,
                messages: vec![Message::user("Write the next question.")],
                max_tokens: self.max_tokens,
            };
            let response = self
                .orchestrator
                .gateway()
                .complete(request, self.timeout)
                .await
                .context(format!("Question generation call {} failed", n))?;

            let text = response.text_or_empty().trim();
            if text.is_empty() {
                return Err(eyre!("Question generation call {} returned no text", n));
            }
            previous.push(text.chars().take(OPENING_CHARS).collect::<String>());
            questions.push(EvalQuestion::new(&format!("business-q{}", n), GENERATED_CATEGORY, text));
        }

        info!(count = questions.len(), "Generated eval questions");
        Ok(questions)
    }

    /// Ask the judge which answer is better
    pub async fn judge(&self, question: &str, response_a: &str, response_b: &str) -> Result<(Verdict, String)> {
        let system_prompt = self.prompts.render(
            "judge",
            &JudgeContext {
                question: question.to_string(),
                response_a: response_a.to_string(),
                response_b: response_b.to_string(),
            },
        )?;
        let request = CompletionRequest {
            system_prompt,
            messages: vec![Message::user("Compare the two responses.")],
            max_tokens: self.max_tokens,
        };
        let response = self
            .orchestrator
            .gateway()
            .complete(request, self.timeout)
            .await
            .context("Judge call failed")?;
        parse_verdict(response.text_or_empty()).map_err(|e| eyre!("Unreadable judge verdict: {}", e))
    }
}

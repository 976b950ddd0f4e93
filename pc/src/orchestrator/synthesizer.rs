//! Synthesizer - one final answer from all successful branch outputs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::error::StepError;
use super::gateway::Gateway;
use crate::events::{ChannelError, TurnEmitter};
use crate::llm::{CompletionRequest, Message, StreamChunk};
use crate::prompts::{PromptLoader, ResultsContext, SubjectOutput};

pub struct Synthesizer {
    gateway: Gateway,
    prompts: Arc<PromptLoader>,
    stream: bool,
    timeout: Duration,
    max_tokens: u32,
}

impl Synthesizer {
    pub fn new(gateway: Gateway, prompts: Arc<PromptLoader>, stream: bool, timeout: Duration, max_tokens: u32) -> Self {
        debug!(stream, ?timeout, max_tokens, "Synthesizer::new: called");
        Self {
            gateway,
            prompts,
            stream,
            timeout,
            max_tokens,
        }
    }

    /// Produce the final answer text
    ///
    /// In streaming mode every delta is emitted as a final-response
    /// `content_chunk` before this returns. The caller emits `final_response`.
    pub async fn synthesize(
        &self,
        query: &str,
        results: Vec<SubjectOutput>,
        emitter: &TurnEmitter,
    ) -> Result<String, StepError> {
        debug!(result_count = results.len(), stream = self.stream, "Synthesizer::synthesize: called");
        let system_prompt = self
            .prompts
            .render(
                "synthesize",
                &ResultsContext {
                    query: query.to_string(),
                    results,
                },
            )
            .map_err(|e| StepError::Prompt(e.to_string()))?;

        let request = CompletionRequest {
            system_prompt,
            messages: vec![Message::user(query)],
            max_tokens: self.max_tokens,
        };

        if !self.stream {
            let response = self.gateway.complete(request, self.timeout).await?;
            return Ok(response.text_or_empty().to_string());
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(64);
        let call = self.gateway.stream(request, self.timeout, chunk_tx);
        let forward = async {
            let mut text = String::new();
            while let Some(chunk) = chunk_rx.recv().await {
                if let StreamChunk::TextDelta(delta) = chunk {
                    text.push_str(&delta);
                    emitter.final_chunk(&delta).await?;
                }
            }
            Ok::<String, ChannelError>(text)
        };

        let (result, streamed) = tokio::join!(call, forward);
        let streamed = streamed?;
        let response = result?;

        let text = match response.content {
            Some(content) if !content.is_empty() => content,
            _ => streamed,
        };
        info!(answer_len = text.len(), "Synthesis complete");
        Ok(text)
    }
}

/// Answer assembled without a model call, for decompositions that
/// recommend against synthesis
pub fn concatenate(results: &[SubjectOutput]) -> String {
    results
        .iter()
        .map(|r| format!("## {}\n\n{}", r.subject, r.output.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{TurnEvent, channel};
    use crate::llm::client::mock::MockLlmClient;

    fn results() -> Vec<SubjectOutput> {
        vec![
            SubjectOutput {
                subject: "Angle: X".to_string(),
                output: "X wins on speed.".to_string(),
            },
            SubjectOutput {
                subject: "Angle: Y".to_string(),
                output: "Y wins on cost.\n".to_string(),
            },
        ]
    }

    fn synthesizer(llm: Arc<MockLlmClient>, stream: bool) -> Synthesizer {
        Synthesizer::new(
            Gateway::new(llm, 2),
            Arc::new(PromptLoader::embedded_only()),
            stream,
            Duration::from_secs(5),
            1024,
        )
    }

    #[tokio::test]
    async fn test_streamed_synthesis_emits_final_chunks() {
        let llm = Arc::new(MockLlmClient::from_texts(&["Pick X overall"]));
        let (emitter, mut rx) = channel(16);

        let text = synthesizer(llm.clone(), true)
            .synthesize("Compare X and Y", results(), &emitter)
            .await
            .unwrap();
        drop(emitter);

        assert_eq!(text, "Pick X overall");
        let prompt = &llm.requests()[0].system_prompt;
        assert!(prompt.contains("### Angle: X"));
        assert!(prompt.contains("Y wins on cost."));

        let mut count = 0;
        while let Some(env) = rx.recv().await {
            match env.event {
                TurnEvent::ContentChunk { metadata, .. } => {
                    assert!(metadata.is_final_response);
                    assert!(metadata.task_index.is_none());
                    count += 1;
                }
                other => panic!("Unexpected event {:?}", other),
            }
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_blocking_synthesis_emits_nothing() {
        let llm = Arc::new(MockLlmClient::from_texts(&["Pick X overall"]));
        let (emitter, mut rx) = channel(16);

        let text = synthesizer(llm, false).synthesize("q", results(), &emitter).await.unwrap();
        drop(emitter);

        assert_eq!(text, "Pick X overall");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_gateway_failure_surfaces() {
        let llm = Arc::new(MockLlmClient::new(vec![]));
        let (emitter, _rx) = channel(16);
        let err = synthesizer(llm, true).synthesize("q", results(), &emitter).await.unwrap_err();
        assert!(matches!(err, StepError::Gateway(_)));
    }

    #[test]
    fn test_concatenate() {
        assert_eq!(
            concatenate(&results()),
            "## Angle: X\n\nX wins on speed.\n\n## Angle: Y\n\nY wins on cost."
        );
    }
}

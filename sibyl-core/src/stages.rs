//! Pipeline stages: retrieval and answer generation.
//!
//! The retrieval stage wraps a [`Retriever`] and attaches passages to the
//! state. Answer generation is behind the [`AnswerGenerator`] trait with two
//! implementations: [`ContextGenerator`] stuffs the passages into a fixed
//! prompt template and calls the provider once, [`AgenticGenerator`] hands
//! the question to a tool-calling reasoning loop. Both support blocking and
//! streaming modes; the two streaming modes merge fragments differently
//! (append for context generation, overwrite for agent step snapshots) and
//! that difference is intentional.

use crate::agent::ToolAgent;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::retriever::Retriever;
use crate::state::{GenerationUpdate, PipelineState};
use crate::types::{CompletionRequest, Message, StreamEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Answer substituted when the reasoning loop produces no final message.
const FALLBACK_ANSWER: &str = "Could not generate answer.";

/// Wraps the retrieval collaborator; one query per invocation.
pub struct RetrievalStage {
    retriever: Arc<dyn Retriever>,
}

impl RetrievalStage {
    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }

    /// Query the retriever with the state's question and produce the
    /// post-retrieval state. Collaborator failures propagate unrecovered.
    pub async fn retrieve(&self, state: &PipelineState) -> Result<PipelineState> {
        let docs = self.retriever.search(&state.question).await?;
        debug!(count = docs.len(), "Retrieved passages");
        Ok(state.with_documents(docs))
    }
}

/// Turns a state with passages into a state with an answer.
///
/// `generate` propagates backend failures. `generate_streaming` never fails
/// outward: failures are folded into the update stream as an error-text
/// fragment, and exactly one [`GenerationUpdate::Final`] is always sent.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, state: &PipelineState) -> Result<PipelineState>;

    async fn generate_streaming(&self, state: &PipelineState, tx: mpsc::Sender<GenerationUpdate>);
}

/// Single-shot generation over a context-stuffed prompt.
pub struct ContextGenerator {
    provider: Arc<dyn LlmProvider>,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl ContextGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Passage bodies in retrieval order, blank-line separated, embedded in
    /// the answer prompt together with the question.
    fn build_prompt(state: &PipelineState) -> String {
        let context = state
            .retrieved_docs
            .iter()
            .map(|p| p.body.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let question = &state.question;
        format!(
            "Answer the question based on the context.\n\nContext:\n{context}\n\nQuestion: {question}"
        )
    }

    fn build_request(&self, state: &PipelineState) -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user(Self::build_prompt(state))],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }
}

#[async_trait]
impl AnswerGenerator for ContextGenerator {
    async fn generate(&self, state: &PipelineState) -> Result<PipelineState> {
        let response = self.provider.complete(self.build_request(state)).await?;
        Ok(state.with_answer(response.message.content.all_text()))
    }

    async fn generate_streaming(&self, state: &PipelineState, tx: mpsc::Sender<GenerationUpdate>) {
        let (etx, mut erx) = mpsc::channel(64);
        let request = self.build_request(state);
        let provider = Arc::clone(&self.provider);
        let producer = tokio::spawn(async move { provider.complete_streaming(request, etx).await });

        // Append semantics: each token extends the running answer, and the
        // running answer (not the delta) is what gets yielded.
        let mut answer = String::new();
        let mut failure: Option<String> = None;

        while let Some(event) = erx.recv().await {
            match event {
                StreamEvent::Token(token) => {
                    if token.is_empty() {
                        continue;
                    }
                    answer.push_str(&token);
                    let _ = tx.send(GenerationUpdate::Fragment(answer.clone())).await;
                }
                StreamEvent::Done { .. } => break,
                StreamEvent::Error(message) => {
                    failure = Some(message);
                    break;
                }
                _ => {}
            }
        }

        if failure.is_none() {
            match producer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(e.to_string()),
                Err(e) => failure = Some(format!("streaming task panicked: {e}")),
            }
        }

        if let Some(message) = failure {
            warn!(error = %message, "Streaming generation failed");
            answer = format!("Error during streaming: {message}");
            let _ = tx.send(GenerationUpdate::Fragment(answer.clone())).await;
        }

        let _ = tx
            .send(GenerationUpdate::Final(state.with_answer(answer)))
            .await;
    }
}

/// Generation through the tool-calling reasoning loop.
pub struct AgenticGenerator {
    agent: Arc<ToolAgent>,
}

impl AgenticGenerator {
    pub fn new(agent: Arc<ToolAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl AnswerGenerator for AgenticGenerator {
    async fn generate(&self, state: &PipelineState) -> Result<PipelineState> {
        let run = self.agent.invoke(&state.question).await?;
        let answer = run
            .final_text()
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK_ANSWER.to_string());
        Ok(state.with_answer(answer))
    }

    async fn generate_streaming(&self, state: &PipelineState, tx: mpsc::Sender<GenerationUpdate>) {
        let (stx, mut srx) = mpsc::channel(64);
        let agent = Arc::clone(&self.agent);
        let question = state.question.clone();
        let producer = tokio::spawn(async move { agent.stream(&question, stx).await });

        // Overwrite semantics: step events carry already-cumulative
        // snapshots, so each non-empty one replaces the accumulated answer.
        let mut answer = String::new();
        while let Some(step) = srx.recv().await {
            if step.content.is_empty() {
                continue;
            }
            answer = step.content;
            let _ = tx.send(GenerationUpdate::Fragment(answer.clone())).await;
        }

        let failure = match producer.await {
            Ok(Ok(_run)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("streaming task panicked: {e}")),
        };

        let answer = match failure {
            Some(message) => {
                warn!(error = %message, "Agentic streaming failed");
                let text = format!("Error generating answer: {message}");
                let _ = tx.send(GenerationUpdate::Fragment(text.clone())).await;
                text
            }
            None if answer.is_empty() => {
                // The step stream carried no usable content; one blocking
                // attempt before settling for the fallback answer.
                let text = match self.agent.invoke(&state.question).await {
                    Ok(run) => run
                        .final_text()
                        .map(str::to_string)
                        .unwrap_or_else(|| FALLBACK_ANSWER.to_string()),
                    Err(e) => format!("Error generating answer: {e}"),
                };
                let _ = tx.send(GenerationUpdate::Fragment(text.clone())).await;
                text
            }
            None => answer,
        };

        let _ = tx
            .send(GenerationUpdate::Final(state.with_answer(answer)))
            .await;
    }
}

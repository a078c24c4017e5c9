//! Tool-calling reasoning loop.
//!
//! `ToolAgent` runs a think → act → observe loop over an [`LlmProvider`]:
//! the model either answers directly or requests tool calls, which are
//! dispatched through a [`ToolRegistry`] and fed back as tool results until
//! the model produces a final answer or the iteration cap is reached.
//! Running out of iterations is not an error; the run simply carries no
//! final text and callers substitute their own fallback.

use crate::error::{LlmError, Result};
use crate::llm::LlmProvider;
use crate::tools::ToolRegistry;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default system prompt for the reasoning loop.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful research agent. \
Prefer 'corpus_search' for user-provided documents; use 'knowledge_search' \
for general knowledge. Return only the final useful answer.";

/// One step of a streaming agent run.
///
/// `content` is the assistant-visible text of the step (empty for bare
/// tool-call turns). `finish_reason` is set only on the final step; its
/// presence is the completion marker streaming consumers key on.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStepEvent {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// The transcript and outcome of one agent run.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Full conversation: system, user, assistant, and tool messages.
    pub messages: Vec<Message>,
    /// Loop iterations consumed.
    pub iterations: usize,
}

impl AgentRun {
    /// The loop's final answer: the last assistant message carrying
    /// non-empty text. `None` when the run ended without one (iteration
    /// cap hit mid-tool-use, or the model returned nothing).
    pub fn final_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| match &m.content {
                Content::Text { text } if !text.is_empty() => Some(text.as_str()),
                Content::MultiPart { parts } => parts.iter().find_map(|p| match p {
                    Content::Text { text } if !text.is_empty() => Some(text.as_str()),
                    _ => None,
                }),
                _ => None,
            })
    }
}

/// Reasoning loop over a provider plus a tool registry.
pub struct ToolAgent {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    system_prompt: String,
    max_iterations: usize,
    temperature: f32,
    max_tokens: Option<usize>,
}

impl ToolAgent {
    pub const DEFAULT_MAX_ITERATIONS: usize = 10;

    pub fn new(provider: Arc<dyn LlmProvider>, tools: ToolRegistry) -> Self {
        Self {
            provider,
            tools,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn build_request(&self, conversation: &[Message]) -> CompletionRequest {
        let tools = if self.tools.is_empty() {
            None
        } else {
            Some(self.tools.definitions())
        };
        CompletionRequest {
            messages: conversation.to_vec(),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            ..Default::default()
        }
    }

    fn seed_conversation(&self, question: &str) -> Vec<Message> {
        vec![
            Message::system(&self.system_prompt),
            Message::user(question),
        ]
    }

    /// Run the loop to completion without step events.
    pub async fn invoke(&self, question: &str) -> Result<AgentRun> {
        let mut conversation = self.seed_conversation(question);
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;
            let response = self
                .provider
                .complete(self.build_request(&conversation))
                .await?;

            let done = self.observe(&mut conversation, &response).await;
            if done {
                break;
            }
        }

        debug!(iterations, "Agent run complete");
        Ok(AgentRun {
            messages: conversation,
            iterations,
        })
    }

    /// Run the loop, emitting one `AgentStepEvent` per iteration.
    ///
    /// The final step's event carries a `finish_reason`. Send failures mean
    /// the consumer stopped listening; the loop finishes regardless so the
    /// returned run is always complete.
    pub async fn stream(
        &self,
        question: &str,
        tx: mpsc::Sender<AgentStepEvent>,
    ) -> Result<AgentRun> {
        let mut conversation = self.seed_conversation(question);
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;
            let response = self.think_streaming(&conversation).await?;

            let content = response.message.content.all_text();
            let done = self.observe(&mut conversation, &response).await;

            let finish_reason = if done {
                response
                    .finish_reason
                    .clone()
                    .or_else(|| Some("stop".to_string()))
            } else {
                None
            };
            let _ = tx
                .send(AgentStepEvent {
                    content,
                    finish_reason,
                })
                .await;

            if done {
                break;
            }
        }

        debug!(iterations, "Agent streaming run complete");
        Ok(AgentRun {
            messages: conversation,
            iterations,
        })
    }

    /// Append the model turn to the conversation, dispatching any tool
    /// calls. Returns true when the turn carried no tool calls, i.e. the
    /// loop is done.
    async fn observe(&self, conversation: &mut Vec<Message>, response: &CompletionResponse) -> bool {
        let calls: Vec<(String, String, serde_json::Value)> = response
            .message
            .content
            .tool_calls()
            .into_iter()
            .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
            .collect();

        conversation.push(response.message.clone());

        if calls.is_empty() {
            return true;
        }

        for (call_id, name, arguments) in calls {
            match self.tools.execute(&name, &arguments).await {
                Ok(output) => {
                    debug!(tool = %name, bytes = output.len(), "Tool call succeeded");
                    conversation.push(Message::tool_result(call_id, output, false));
                }
                Err(e) => {
                    warn!(tool = %name, error = %e, "Tool call failed");
                    conversation.push(Message::tool_result(call_id, e.to_string(), true));
                }
            }
        }
        false
    }

    /// One streamed model turn, reassembled into a `CompletionResponse`.
    async fn think_streaming(&self, conversation: &[Message]) -> Result<CompletionResponse> {
        let (tx, mut rx) = mpsc::channel(64);
        let request = self.build_request(conversation);

        // Run the streaming completion in a background task so the producer
        // and the consumer loop run concurrently; awaiting it inline would
        // deadlock once the bounded channel fills.
        let provider = Arc::clone(&self.provider);
        let producer = tokio::spawn(async move { provider.complete_streaming(request, tx).await });

        let mut text = String::new();
        let mut usage = TokenUsage::default();
        // id -> (name, accumulated argument JSON), arrival order kept apart
        let mut tool_calls: HashMap<String, (String, String)> = HashMap::new();
        let mut call_order: Vec<String> = Vec::new();

        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token(token) => text.push_str(&token),
                StreamEvent::ToolCallStart { id, name } => {
                    call_order.push(id.clone());
                    tool_calls.insert(id, (name, String::new()));
                }
                StreamEvent::ToolCallDelta {
                    id,
                    arguments_delta,
                } => {
                    if let Some((_, args)) = tool_calls.get_mut(&id) {
                        args.push_str(&arguments_delta);
                    }
                }
                StreamEvent::ToolCallEnd { .. } => {}
                StreamEvent::Done { usage: u } => {
                    usage = u;
                    break;
                }
                StreamEvent::Error(e) => {
                    return Err(LlmError::Streaming { message: e }.into());
                }
            }
        }

        producer
            .await
            .map_err(|e| LlmError::Streaming {
                message: format!("Streaming task panicked: {e}"),
            })??;

        let mut parts: Vec<Content> = Vec::new();
        if !text.is_empty() {
            parts.push(Content::text(text.as_str()));
        }
        for id in &call_order {
            if let Some((name, args_str)) = tool_calls.get(id) {
                let arguments: serde_json::Value =
                    serde_json::from_str(args_str).unwrap_or_else(|_| serde_json::json!({}));
                parts.push(Content::tool_call(id.as_str(), name.as_str(), arguments));
            }
        }
        let content = match parts.len() {
            0 => Content::text(""),
            1 => parts.remove(0),
            _ => Content::MultiPart { parts },
        };

        let finish_reason = if call_order.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };

        Ok(CompletionResponse {
            message: Message::new(Role::Assistant, content),
            usage,
            model: self.provider.model_name().to_string(),
            finish_reason: Some(finish_reason.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetrievalError;
    use crate::llm::MockLlmProvider;
    use crate::retriever::Retriever;
    use crate::state::Passage;
    use crate::tools::CorpusSearchTool;
    use serde_json::json;

    struct FixedRetriever {
        passages: Vec<Passage>,
    }

    #[async_trait::async_trait]
    impl Retriever for FixedRetriever {
        async fn search(
            &self,
            _query: &str,
        ) -> std::result::Result<Vec<Passage>, RetrievalError> {
            Ok(self.passages.clone())
        }
    }

    fn agent_with(provider: MockLlmProvider, passages: Vec<Passage>) -> ToolAgent {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CorpusSearchTool::new(Arc::new(FixedRetriever {
            passages,
        }))));
        ToolAgent::new(Arc::new(provider), registry)
    }

    // --- invoke ---

    #[tokio::test]
    async fn test_invoke_direct_answer() {
        let provider = MockLlmProvider::new();
        provider.queue_response(MockLlmProvider::text_response("direct answer"));
        let agent = agent_with(provider, vec![]);

        let run = agent.invoke("question").await.unwrap();
        assert_eq!(run.iterations, 1);
        assert_eq!(run.final_text(), Some("direct answer"));
    }

    #[tokio::test]
    async fn test_invoke_tool_then_answer() {
        let provider = MockLlmProvider::new();
        provider.queue_response(MockLlmProvider::tool_call_response(
            "corpus_search",
            json!({"query": "rust"}),
        ));
        provider.queue_response(MockLlmProvider::text_response("answer from docs"));
        let agent = agent_with(provider, vec![Passage::new("Rust text")]);

        let run = agent.invoke("what is rust?").await.unwrap();
        assert_eq!(run.iterations, 2);
        assert_eq!(run.final_text(), Some("answer from docs"));

        // tool result landed in the transcript, not flagged as an error
        let tool_result = run
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("tool result message");
        match &tool_result.content {
            Content::ToolResult {
                output, is_error, ..
            } => {
                assert!(output.contains("Rust text"));
                assert!(!is_error);
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool_becomes_error_result() {
        let provider = MockLlmProvider::new();
        provider.queue_response(MockLlmProvider::tool_call_response(
            "not_a_tool",
            json!({}),
        ));
        provider.queue_response(MockLlmProvider::text_response("recovered"));
        let agent = agent_with(provider, vec![]);

        let run = agent.invoke("q").await.unwrap();
        assert_eq!(run.final_text(), Some("recovered"));

        let error_result = run.messages.iter().any(|m| {
            matches!(
                &m.content,
                Content::ToolResult { is_error: true, .. }
            )
        });
        assert!(error_result);
    }

    #[tokio::test]
    async fn test_invoke_iteration_cap_leaves_no_final_text() {
        let provider = MockLlmProvider::new();
        for _ in 0..3 {
            provider.queue_response(MockLlmProvider::tool_call_response(
                "corpus_search",
                json!({"query": "loop"}),
            ));
        }
        let agent = agent_with(provider, vec![Passage::new("doc")]).with_max_iterations(3);

        let run = agent.invoke("q").await.unwrap();
        assert_eq!(run.iterations, 3);
        assert_eq!(run.final_text(), None);
    }

    #[tokio::test]
    async fn test_multipart_final_text() {
        let provider = MockLlmProvider::new();
        provider.queue_response(MockLlmProvider::multipart_response(
            "looking this up",
            "corpus_search",
            json!({"query": "q"}),
        ));
        provider.queue_response(MockLlmProvider::text_response("done"));
        let agent = agent_with(provider, vec![Passage::new("doc")]);

        let run = agent.invoke("q").await.unwrap();
        assert_eq!(run.final_text(), Some("done"));
    }

    // --- stream ---

    #[tokio::test]
    async fn test_stream_emits_final_marker() {
        let provider = MockLlmProvider::new();
        provider.queue_stream_events(vec![
            StreamEvent::ToolCallStart {
                id: "c1".into(),
                name: "corpus_search".into(),
            },
            StreamEvent::ToolCallDelta {
                id: "c1".into(),
                arguments_delta: "{\"query\": \"rust\"}".into(),
            },
            StreamEvent::ToolCallEnd { id: "c1".into() },
            StreamEvent::Done {
                usage: TokenUsage::default(),
            },
        ]);
        provider.queue_stream_tokens(&["final ", "answer"]);
        let agent = agent_with(provider, vec![Passage::new("doc")]);

        let (tx, mut rx) = mpsc::channel(16);
        let run = agent.stream("q", tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.content, "");
        assert!(first.finish_reason.is_none());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.content, "final answer");
        assert_eq!(second.finish_reason.as_deref(), Some("stop"));

        assert!(rx.recv().await.is_none());
        assert_eq!(run.final_text(), Some("final answer"));
    }

    #[tokio::test]
    async fn test_stream_propagates_midstream_error() {
        let provider = MockLlmProvider::new();
        provider.queue_stream_events(vec![
            StreamEvent::Token("par".into()),
            StreamEvent::Error("connection reset".into()),
        ]);
        let agent = agent_with(provider, vec![]);

        let (tx, _rx) = mpsc::channel(16);
        let result = agent.stream("q", tx).await;
        assert!(result.is_err());
    }
}

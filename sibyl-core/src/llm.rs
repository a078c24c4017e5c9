//! LLM provider abstraction.
//!
//! Defines the `LlmProvider` trait for model-agnostic blocking and streaming
//! completions, plus a mock implementation used by tests and offline runs.
//! Concrete network-backed adapters live in [`crate::providers`].

use crate::error::LlmError;
use crate::types::{CompletionRequest, CompletionResponse, Message, StreamEvent, TokenUsage};
use tokio::sync::mpsc;

/// Trait for LLM providers, supporting both full and streaming completions.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full completion and return the response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Perform a streaming completion, sending normalized events to the
    /// channel. The last event is either `Done` or `Error`; a send failure
    /// means the consumer went away and is not an error.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

enum StreamScript {
    /// Send these events verbatim, then return Ok.
    Events(Vec<StreamEvent>),
    /// Return this error from `complete_streaming` without sending anything.
    Failure(String),
}

/// A mock LLM provider for testing and development.
///
/// `complete` pops queued responses in order. `complete_streaming` pops a
/// queued script when one exists; otherwise it streams the next queued
/// response's text split on whitespace, one token per word.
pub struct MockLlmProvider {
    model: String,
    responses: std::sync::Mutex<Vec<CompletionResponse>>,
    stream_scripts: std::sync::Mutex<Vec<StreamScript>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: std::sync::Mutex::new(Vec::new()),
            stream_scripts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a MockLlmProvider that always returns the given text.
    ///
    /// Queues multiple copies of the response so it can handle multiple calls.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue_response(Self::text_response(text));
        }
        provider
    }

    /// Queue a response to be returned by the next `complete` call.
    pub fn queue_response(&self, response: CompletionResponse) {
        self.responses.lock().unwrap().push(response);
    }

    /// Queue a scripted event sequence for the next `complete_streaming` call.
    pub fn queue_stream_events(&self, events: Vec<StreamEvent>) {
        self.stream_scripts
            .lock()
            .unwrap()
            .push(StreamScript::Events(events));
    }

    /// Queue token deltas for the next `complete_streaming` call, followed
    /// by a `Done` event.
    pub fn queue_stream_tokens(&self, tokens: &[&str]) {
        let mut events: Vec<StreamEvent> = tokens
            .iter()
            .map(|t| StreamEvent::Token((*t).to_string()))
            .collect();
        events.push(StreamEvent::Done {
            usage: TokenUsage::default(),
        });
        self.queue_stream_events(events);
    }

    /// Make the next `complete_streaming` call fail before sending anything.
    pub fn queue_stream_failure(&self, message: &str) {
        self.stream_scripts
            .lock()
            .unwrap()
            .push(StreamScript::Failure(message.to_string()));
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    /// Create a tool call response for testing.
    pub fn tool_call_response(tool_name: &str, arguments: serde_json::Value) -> CompletionResponse {
        let call_id = format!("call_{}", uuid::Uuid::new_v4());
        CompletionResponse {
            message: Message::new(
                crate::types::Role::Assistant,
                crate::types::Content::tool_call(&call_id, tool_name, arguments),
            ),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    /// Create a multipart response (text + tool call) for testing.
    pub fn multipart_response(
        text: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> CompletionResponse {
        let call_id = format!("call_{}", uuid::Uuid::new_v4());
        CompletionResponse {
            message: Message::new(
                crate::types::Role::Assistant,
                crate::types::Content::MultiPart {
                    parts: vec![
                        crate::types::Content::text(text),
                        crate::types::Content::tool_call(&call_id, tool_name, arguments),
                    ],
                },
            ),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(MockLlmProvider::text_response(
                "I'm a mock LLM. No queued responses available.",
            ))
        } else {
            Ok(responses.remove(0))
        }
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let script = {
            let mut scripts = self.stream_scripts.lock().unwrap();
            if scripts.is_empty() {
                None
            } else {
                Some(scripts.remove(0))
            }
        };

        match script {
            Some(StreamScript::Events(events)) => {
                for event in events {
                    let _ = tx.send(event).await;
                }
                Ok(())
            }
            Some(StreamScript::Failure(message)) => Err(LlmError::Streaming { message }),
            None => {
                let response = self.complete(request).await?;
                if let Some(text) = response.message.content.as_text() {
                    for word in text.split_whitespace() {
                        let _ = tx.send(StreamEvent::Token(format!("{} ", word))).await;
                    }
                }
                let _ = tx
                    .send(StreamEvent::Done {
                        usage: response.usage,
                    })
                    .await;
                Ok(())
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

//! OpenAI-compatible LLM provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any
//! endpoint that follows the OpenAI chat completions API format.

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::LlmProvider;
use crate::types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// OpenAI-compatible LLM provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: Option<u64>,
}

impl OpenAiCompatibleProvider {
    /// Create a new provider from configuration.
    ///
    /// Reads the API key from the environment variable specified in
    /// `config.api_key_env`. Local endpoints (Ollama, vLLM, LM Studio) get
    /// a dummy bearer token when no key is set.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let is_local = config
            .base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false);

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("ollama".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!(
                    "OpenAI-compatible: env var '{}' not set",
                    config.api_key_env
                ),
            })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(std::time::Duration::from_secs(secs));
        }
        let client = builder.build().map_err(|e| LlmError::Connection {
            message: format!("Failed to build HTTP client: {}", e),
        })?;

        Ok(Self {
            client,
            base_url,
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    /// Convert internal messages to OpenAI JSON format.
    fn messages_to_json(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                    Role::Tool => "tool",
                };
                match &msg.content {
                    Content::Text { text } => json!({
                        "role": role,
                        "content": text,
                    }),
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => json!({
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": arguments.to_string(),
                            }
                        }]
                    }),
                    Content::ToolResult {
                        call_id, output, ..
                    } => json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": output,
                    }),
                    Content::MultiPart { parts } => {
                        let mut text_parts = Vec::new();
                        let mut tool_calls = Vec::new();
                        for part in parts {
                            match part {
                                Content::Text { text } => text_parts.push(text.clone()),
                                Content::ToolCall {
                                    id,
                                    name,
                                    arguments,
                                } => {
                                    tool_calls.push(json!({
                                        "id": id,
                                        "type": "function",
                                        "function": {
                                            "name": name,
                                            "arguments": arguments.to_string(),
                                        }
                                    }));
                                }
                                _ => {}
                            }
                        }
                        if !tool_calls.is_empty() {
                            json!({
                                "role": "assistant",
                                "content": if text_parts.is_empty() { Value::Null } else { Value::String(text_parts.join("\n")) },
                                "tool_calls": tool_calls,
                            })
                        } else {
                            json!({
                                "role": role,
                                "content": text_parts.join("\n"),
                            })
                        }
                    }
                }
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI format.
    fn tools_to_json(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": Self::messages_to_json(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(tools) = &request.tools
            && !tools.is_empty()
        {
            body["tools"] = json!(Self::tools_to_json(tools));
        }
        body
    }

    /// Parse an OpenAI-format response body into a CompletionResponse.
    fn parse_response(body: &Value, model: &str) -> Result<CompletionResponse, LlmError> {
        let choice =
            body.get("choices")
                .and_then(|c| c.get(0))
                .ok_or_else(|| LlmError::ResponseParse {
                    message: "No choices in response".to_string(),
                })?;

        let message = choice
            .get("message")
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message in choice".to_string(),
            })?;

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(|s| s.to_string());

        // Content is either text or one or more tool calls
        let content = if let Some(tool_calls) = message.get("tool_calls") {
            let mut calls: Vec<Content> = tool_calls
                .as_array()
                .map(|arr| arr.as_slice())
                .unwrap_or_default()
                .iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let args_str = func.get("arguments")?.as_str()?;
                    let arguments: Value = serde_json::from_str(args_str).unwrap_or(json!({}));
                    Some(Content::ToolCall {
                        id,
                        name,
                        arguments,
                    })
                })
                .collect();

            if calls.is_empty() {
                Content::text(
                    message
                        .get("content")
                        .and_then(|c| c.as_str())
                        .unwrap_or(""),
                )
            } else if calls.len() == 1 {
                calls.remove(0)
            } else {
                let mut parts = Vec::new();
                if let Some(text) = message.get("content").and_then(|c| c.as_str())
                    && !text.is_empty()
                {
                    parts.push(Content::text(text));
                }
                parts.append(&mut calls);
                Content::MultiPart { parts }
            }
        } else {
            Content::text(
                message
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or(""),
            )
        };

        let usage_obj = body.get("usage");
        let usage = TokenUsage {
            input_tokens: usage_obj
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
            output_tokens: usage_obj
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
        };

        let resp_model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();

        Ok(CompletionResponse {
            message: Message::new(Role::Assistant, content),
            usage,
            model: resp_model,
            finish_reason,
        })
    }

    /// Parse a single SSE data line. Returns the parsed JSON if valid.
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line.strip_prefix("data: ")?;
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    /// Process one streamed chunk, emitting events for content and tool-call
    /// deltas. Returns usage when the chunk carries it.
    async fn process_stream_chunk(
        data: &Value,
        tx: &mpsc::Sender<StreamEvent>,
        active_tool_calls: &mut HashMap<usize, (String, String)>,
    ) -> Option<TokenUsage> {
        let mut usage = None;
        if let Some(u) = data.get("usage")
            && !u.is_null()
        {
            usage = Some(TokenUsage {
                input_tokens: u.get("prompt_tokens").and_then(|t| t.as_u64()).unwrap_or(0) as usize,
                output_tokens: u
                    .get("completion_tokens")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(0) as usize,
            });
        }

        if let Some(choice) = data.get("choices").and_then(|c| c.get(0)) {
            let empty_obj = json!({});
            let delta = choice.get("delta").unwrap_or(&empty_obj);

            if let Some(content) = delta.get("content").and_then(|c| c.as_str())
                && !content.is_empty()
            {
                let _ = tx.send(StreamEvent::Token(content.to_string())).await;
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;

                    if let Some(func) = tc.get("function") {
                        if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                            let id = tc
                                .get("id")
                                .and_then(|i| i.as_str())
                                .unwrap_or("")
                                .to_string();
                            active_tool_calls.insert(index, (id.clone(), name.to_string()));
                            let _ = tx
                                .send(StreamEvent::ToolCallStart {
                                    id,
                                    name: name.to_string(),
                                })
                                .await;
                        }
                        if let Some(args) = func.get("arguments").and_then(|a| a.as_str())
                            && !args.is_empty()
                            && let Some((id, _)) = active_tool_calls.get(&index)
                        {
                            let _ = tx
                                .send(StreamEvent::ToolCallDelta {
                                    id: id.clone(),
                                    arguments_delta: args.to_string(),
                                })
                                .await;
                        }
                    }
                }
            }

            if let Some(finish) = choice.get("finish_reason").and_then(|f| f.as_str())
                && finish == "tool_calls"
            {
                for (_, (id, _)) in active_tool_calls.drain() {
                    let _ = tx.send(StreamEvent::ToolCallEnd { id }).await;
                }
            }
        }

        usage
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 => {
                debug!(body = %body, "Authentication failed (401)");
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                // Try to parse "try again in Xs" from the error message
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        msg.split("in ")
                            .last()
                            .and_then(|s| s.trim_end_matches('s').parse::<u64>().ok())
                    })
                    .unwrap_or(5);
                LlmError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => LlmError::ApiRequest {
                message: format!("Server error ({}): {}", status, body),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                timeout_secs: self.timeout_secs.unwrap_or_default(),
            }
        } else if e.is_connect() {
            LlmError::Connection {
                message: format!("Connection failed: {}", e),
            }
        } else {
            LlmError::ApiRequest {
                message: format!("Request failed: {}", e),
            }
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request, false);

        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;

        Self::parse_response(&json, &self.model)
    }

    async fn complete_streaming(
        &self,
        request: CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request, true);

        debug!(url = %url, model = %self.model, "Sending streaming completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &body_text));
        }

        // Stream SSE events incrementally so tokens surface as they arrive
        // rather than after the full body lands.
        let mut byte_stream = response.bytes_stream();
        let mut usage = TokenUsage::default();
        let mut active_tool_calls: HashMap<usize, (String, String)> = HashMap::new();
        let mut line_buffer = String::new();
        let mut saw_done = false;

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read streaming chunk: {}", e),
            })?;

            line_buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete lines from the buffer
            while let Some(newline_pos) = line_buffer.find('\n') {
                let line = line_buffer[..newline_pos].trim().to_string();
                line_buffer = line_buffer[newline_pos + 1..].to_string();

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" {
                    saw_done = true;
                    break;
                }
                match Self::parse_sse_line(&line) {
                    Some(data) => {
                        if let Some(u) =
                            Self::process_stream_chunk(&data, &tx, &mut active_tool_calls).await
                        {
                            usage = u;
                        }
                    }
                    None => {
                        warn!(line = %line, "Skipping unparseable SSE line");
                    }
                }
            }
            if saw_done {
                break;
            }
        }

        // Process any remaining data in the buffer
        if !saw_done {
            let remaining = line_buffer.trim();
            if let Some(data) = Self::parse_sse_line(remaining)
                && let Some(u) = Self::process_stream_chunk(&data, &tx, &mut active_tool_calls).await
            {
                usage = u;
            }
        }

        let _ = tx.send(StreamEvent::Done { usage }).await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LlmConfig {
        LlmConfig {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "SIBYL_TEST_OPENAI_KEY".to_string(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.7,
            timeout_secs: None,
        }
    }

    #[test]
    fn test_messages_to_json_text() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("Hello"),
            Message::assistant("Hi there"),
        ];
        let json = OpenAiCompatibleProvider::messages_to_json(&messages);
        assert_eq!(json.len(), 3);
        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[0]["content"], "You are helpful");
        assert_eq!(json[1]["role"], "user");
        assert_eq!(json[2]["role"], "assistant");
    }

    #[test]
    fn test_messages_to_json_tool_call() {
        let msg = Message::new(
            Role::Assistant,
            Content::tool_call("call_123", "corpus_search", json!({"query": "rust"})),
        );
        let json = OpenAiCompatibleProvider::messages_to_json(&[msg]);
        assert_eq!(json[0]["role"], "assistant");
        assert!(json[0]["tool_calls"].is_array());
        assert_eq!(json[0]["tool_calls"][0]["id"], "call_123");
        assert_eq!(json[0]["tool_calls"][0]["function"]["name"], "corpus_search");
    }

    #[test]
    fn test_messages_to_json_tool_result() {
        let msg = Message::new(
            Role::Tool,
            Content::ToolResult {
                call_id: "call_123".to_string(),
                output: "passage text".to_string(),
                is_error: false,
            },
        );
        let json = OpenAiCompatibleProvider::messages_to_json(&[msg]);
        assert_eq!(json[0]["role"], "tool");
        assert_eq!(json[0]["tool_call_id"], "call_123");
        assert_eq!(json[0]["content"], "passage text");
    }

    #[test]
    fn test_messages_to_json_multipart() {
        let msg = Message::new(
            Role::Assistant,
            Content::MultiPart {
                parts: vec![
                    Content::text("Let me check."),
                    Content::tool_call("call_1", "knowledge_search", json!({"query": "ferris"})),
                ],
            },
        );
        let json = OpenAiCompatibleProvider::messages_to_json(&[msg]);
        assert_eq!(json[0]["role"], "assistant");
        assert_eq!(json[0]["content"], "Let me check.");
        assert_eq!(json[0]["tool_calls"][0]["function"]["name"], "knowledge_search");
    }

    #[test]
    fn test_tools_to_json() {
        let tools = vec![ToolDefinition {
            name: "corpus_search".to_string(),
            description: "Fetch passages".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" }
                }
            }),
        }];
        let json = OpenAiCompatibleProvider::tools_to_json(&tools);
        assert_eq!(json.len(), 1);
        assert_eq!(json[0]["type"], "function");
        assert_eq!(json[0]["function"]["name"], "corpus_search");
    }

    #[test]
    fn test_parse_text_response() {
        let body = json!({
            "id": "chatcmpl-123",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Hello! How can I help?"
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 8,
                "total_tokens": 18
            },
            "model": "gpt-4o"
        });
        let resp = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o").unwrap();
        assert_eq!(
            resp.message.content.as_text().unwrap(),
            "Hello! How can I help?"
        );
        assert_eq!(resp.usage.input_tokens, 10);
        assert_eq!(resp.usage.output_tokens, 8);
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.model, "gpt-4o");
    }

    #[test]
    fn test_parse_tool_call_response() {
        let body = json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "corpus_search",
                            "arguments": "{\"query\":\"borrow checker\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {
                "prompt_tokens": 20,
                "completion_tokens": 15
            },
            "model": "gpt-4o"
        });
        let resp = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o").unwrap();
        match &resp.message.content {
            Content::ToolCall {
                id,
                name,
                arguments,
            } => {
                assert_eq!(id, "call_abc");
                assert_eq!(name, "corpus_search");
                assert_eq!(arguments["query"], "borrow checker");
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_parse_multiple_tool_calls_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [
                        {
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "corpus_search", "arguments": "{}"}
                        },
                        {
                            "id": "call_2",
                            "type": "function",
                            "function": {"name": "knowledge_search", "arguments": "{}"}
                        }
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o").unwrap();
        match &resp.message.content {
            Content::MultiPart { parts } => {
                assert_eq!(parts.len(), 2);
            }
            other => panic!("Expected MultiPart, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_response_no_choices() {
        let body = json!({"choices": []});
        let result = OpenAiCompatibleProvider::parse_response(&body, "gpt-4o");
        assert!(result.is_err());
    }

    #[test]
    fn test_http_error_mapping_401() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::UNAUTHORIZED,
            "Unauthorized",
        );
        match err {
            LlmError::AuthFailed { .. } => {}
            other => panic!("Expected AuthFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_mapping_429() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"Rate limit exceeded, try again in 12s"}}"#,
        );
        match err {
            LlmError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, 12);
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_mapping_429_without_hint_defaults() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        );
        match err {
            LlmError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, 5);
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn test_http_error_mapping_500() {
        let err = OpenAiCompatibleProvider::map_http_error(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
        );
        match err {
            LlmError::ApiRequest { message } => {
                assert!(message.contains("500"));
            }
            other => panic!("Expected ApiRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sse_line_valid() {
        let line = r#"data: {"id":"chatcmpl-123","choices":[{"delta":{"content":"Hello"}}]}"#;
        let parsed = OpenAiCompatibleProvider::parse_sse_line(line);
        assert!(parsed.is_some());
        let val = parsed.unwrap();
        assert_eq!(val["id"], "chatcmpl-123");
    }

    #[test]
    fn test_parse_sse_line_done() {
        let line = "data: [DONE]";
        assert!(OpenAiCompatibleProvider::parse_sse_line(line).is_none());
    }

    #[test]
    fn test_parse_sse_line_not_data() {
        let line = "event: message";
        assert!(OpenAiCompatibleProvider::parse_sse_line(line).is_none());
    }

    #[tokio::test]
    async fn test_process_stream_chunk_content_token() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut active = HashMap::new();
        let data = json!({
            "choices": [{"delta": {"content": "Hel"}}]
        });
        let usage =
            OpenAiCompatibleProvider::process_stream_chunk(&data, &tx, &mut active).await;
        assert!(usage.is_none());
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::Token("Hel".into()));
    }

    #[tokio::test]
    async fn test_process_stream_chunk_tool_call_lifecycle() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut active = HashMap::new();

        let start = json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "id": "call_9",
                "function": {"name": "corpus_search", "arguments": ""}
            }]}}]
        });
        OpenAiCompatibleProvider::process_stream_chunk(&start, &tx, &mut active).await;

        let delta = json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "function": {"arguments": "{\"query\":"}
            }]}}]
        });
        OpenAiCompatibleProvider::process_stream_chunk(&delta, &tx, &mut active).await;

        let finish = json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
        });
        OpenAiCompatibleProvider::process_stream_chunk(&finish, &tx, &mut active).await;

        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::ToolCallStart {
                id: "call_9".into(),
                name: "corpus_search".into(),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::ToolCallDelta {
                id: "call_9".into(),
                arguments_delta: "{\"query\":".into(),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::ToolCallEnd { id: "call_9".into() }
        );
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_process_stream_chunk_usage() {
        let (tx, _rx) = mpsc::channel(8);
        let mut active = HashMap::new();
        let data = json!({
            "choices": [],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        });
        let usage =
            OpenAiCompatibleProvider::process_stream_chunk(&data, &tx, &mut active).await;
        let usage = usage.expect("usage chunk");
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn test_new_reads_env() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::set_var("SIBYL_TEST_OPENAI_KEY", "sk-test-key") };
        let config = test_config();
        let provider = OpenAiCompatibleProvider::new(&config).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_OPENAI_KEY") };
    }

    #[test]
    fn test_new_missing_key() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_OPENAI_KEY_MISSING") };
        let mut config = test_config();
        config.api_key_env = "SIBYL_TEST_OPENAI_KEY_MISSING".to_string();
        let result = OpenAiCompatibleProvider::new(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_custom_base_url() {
        let mut config = test_config();
        config.base_url = Some("http://localhost:11434/v1".to_string());
        let provider =
            OpenAiCompatibleProvider::new_with_key(&config, "test-key".to_string()).unwrap();
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_local_provider_no_api_key_required() {
        // Ollama on localhost should not require an API key env var
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_OLLAMA_KEY_NONEXISTENT") };
        let mut config = test_config();
        config.api_key_env = "SIBYL_TEST_OLLAMA_KEY_NONEXISTENT".to_string();
        config.base_url = Some("http://localhost:11434/v1".to_string());
        config.model = "llama3".to_string();
        let result = OpenAiCompatibleProvider::new(&config);
        assert!(result.is_ok(), "Ollama localhost should not require API key");
        let provider = result.unwrap();
        assert_eq!(provider.model_name(), "llama3");
    }

    #[test]
    fn test_loopback_address_no_api_key_required() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_OLLAMA_KEY_NONEXISTENT2") };
        let mut config = test_config();
        config.api_key_env = "SIBYL_TEST_OLLAMA_KEY_NONEXISTENT2".to_string();
        config.base_url = Some("http://127.0.0.1:11434/v1".to_string());
        let result = OpenAiCompatibleProvider::new(&config);
        assert!(result.is_ok(), "127.0.0.1 should not require API key");
    }

    #[test]
    fn test_remote_provider_still_requires_api_key() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_REMOTE_KEY_NONEXISTENT") };
        let mut config = test_config();
        config.api_key_env = "SIBYL_TEST_REMOTE_KEY_NONEXISTENT".to_string();
        config.base_url = None;
        let result = OpenAiCompatibleProvider::new(&config);
        assert!(result.is_err(), "Remote provider must require API key");
    }

    #[test]
    fn test_build_body_includes_stream_options() {
        let mut config = test_config();
        config.base_url = Some("http://localhost:11434/v1".to_string());
        let provider =
            OpenAiCompatibleProvider::new_with_key(&config, "k".to_string()).unwrap();

        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            max_tokens: Some(256),
            ..Default::default()
        };
        let body = provider.build_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["model"], "gpt-4o");

        let body = provider.build_body(&request, false);
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }
}

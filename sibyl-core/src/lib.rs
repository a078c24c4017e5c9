//! # Sibyl Core
//!
//! Core library for the Sibyl retrieval-augmented question answering pipeline.
//! Provides the two-stage pipeline (retrieve, then generate), the LLM provider
//! interface, in-memory retrieval, the tool-calling agent, configuration, and
//! fundamental types.

pub mod agent;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod providers;
pub mod retriever;
pub mod stages;
pub mod state;
pub mod tools;
pub mod types;

// Re-export commonly used types at the crate root.
pub use agent::{AgentRun, AgentStepEvent, DEFAULT_SYSTEM_PROMPT, ToolAgent};
pub use config::{AgentLoopConfig, LlmConfig, RetrievalConfig, SibylConfig, load_config};
pub use error::{LlmError, Result, RetrievalError, SibylError, ToolError};
pub use knowledge::{KnowledgeEntry, KnowledgeSource, WikipediaClient};
pub use llm::{LlmProvider, MockLlmProvider};
pub use pipeline::Pipeline;
pub use providers::{OpenAiCompatibleProvider, create_provider};
pub use retriever::{InMemoryRetriever, Retriever};
pub use stages::{AgenticGenerator, AnswerGenerator, ContextGenerator, RetrievalStage};
pub use state::{GenerationUpdate, Passage, PipelineEvent, PipelinePhase, PipelineState};
pub use tools::{CorpusSearchTool, KnowledgeSearchTool, Tool, ToolRegistry};
pub use types::{
    CompletionRequest, CompletionResponse, Content, Message, Role, StreamEvent, TokenUsage,
    ToolDefinition,
};

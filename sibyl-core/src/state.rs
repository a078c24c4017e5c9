//! Pipeline state and progress-event types.
//!
//! A `PipelineState` threads through the two pipeline stages. Stages never
//! mutate their input: each produces a fresh state value, so repeated or
//! concurrent stage calls on the same input are side-effect-free with
//! respect to the state itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A retrieved unit of text plus metadata, used as generation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    /// The passage body text.
    pub body: String,
    /// Metadata keys to values (commonly "title" and "source").
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Relevance score assigned by the retriever, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl Passage {
    /// Create a passage with no metadata.
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            metadata: HashMap::new(),
            score: None,
        }
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Human-readable title for this passage.
    ///
    /// Falls back from the "title" metadata key to "source", then to
    /// `doc_{index}` (1-based) when neither is present.
    pub fn display_title(&self, index: usize) -> String {
        self.metadata
            .get("title")
            .or_else(|| self.metadata.get("source"))
            .cloned()
            .unwrap_or_else(|| format!("doc_{}", index))
    }
}

/// The sole data object threaded through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// The user question. Set once at pipeline start, immutable thereafter.
    pub question: String,
    /// Passages in retrieval-relevance order. Set by the retrieval stage,
    /// only ever read afterwards.
    #[serde(default)]
    pub retrieved_docs: Vec<Passage>,
    /// The full generated answer. `None` until the generation stage
    /// completes; never holds a partial fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl PipelineState {
    /// Create the initial state for a question.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            retrieved_docs: Vec::new(),
            answer: None,
        }
    }

    /// Produce the post-retrieval state: same question, new documents,
    /// answer unset.
    pub fn with_documents(&self, docs: Vec<Passage>) -> Self {
        Self {
            question: self.question.clone(),
            retrieved_docs: docs,
            answer: None,
        }
    }

    /// Produce the post-generation state: question and documents carried
    /// over unchanged, answer set.
    pub fn with_answer(&self, answer: impl Into<String>) -> Self {
        Self {
            question: self.question.clone(),
            retrieved_docs: self.retrieved_docs.clone(),
            answer: Some(answer.into()),
        }
    }
}

/// Pipeline phase tag for progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Retrieving,
    Generating,
    Complete,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelinePhase::Retrieving => write!(f, "retrieving"),
            PipelinePhase::Generating => write!(f, "generating"),
            PipelinePhase::Complete => write!(f, "complete"),
        }
    }
}

/// A caller-facing progress event emitted during streaming execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub phase: PipelinePhase,
    /// Status text during retrieval, the cumulative answer-so-far during
    /// generation, the final answer on completion.
    pub content: String,
    /// State snapshot current at emission time. `None` only for the very
    /// first retrieving event, before any state exists.
    pub state: Option<PipelineState>,
}

impl PipelineEvent {
    pub fn new(phase: PipelinePhase, content: impl Into<String>, state: Option<PipelineState>) -> Self {
        Self {
            phase,
            content: content.into(),
            state,
        }
    }
}

/// One item of a streaming generation sequence.
///
/// Streaming generation emits zero or more `Fragment`s (each carrying the
/// cumulative answer-so-far) and then exactly one `Final` with the complete
/// terminal state. Modeling the terminal state as an explicit item keeps the
/// always-terminal guarantee visible in the type rather than relying on a
/// side channel.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationUpdate {
    /// The cumulative answer-so-far after merging one more fragment.
    Fragment(String),
    /// The terminal state carrying the complete answer.
    Final(PipelineState),
}

//! Retrieval collaborator interface and the built-in in-memory retriever.
//!
//! The pipeline only depends on the `Retriever` trait; how passages were
//! embedded, chunked, or indexed is outside this crate. `InMemoryRetriever`
//! serves pre-chunked corpora with keyword scoring and is the default
//! collaborator for tests and local runs.

use crate::error::{RetrievalError, SibylError};
use crate::state::Passage;
use std::path::Path;
use tracing::debug;

/// A retrieval collaborator: turns a query into ordered passages.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Return passages relevant to the query, most relevant first.
    ///
    /// An empty result is valid and means nothing matched.
    async fn search(&self, query: &str) -> Result<Vec<Passage>, RetrievalError>;
}

/// Keyword-scoring retriever over an in-memory corpus.
#[derive(Debug)]
pub struct InMemoryRetriever {
    passages: Vec<Passage>,
    limit: usize,
}

impl InMemoryRetriever {
    /// Default number of passages returned per query.
    pub const DEFAULT_LIMIT: usize = 4;

    pub fn new(passages: Vec<Passage>) -> Self {
        Self {
            passages,
            limit: Self::DEFAULT_LIMIT,
        }
    }

    /// Cap the number of passages returned per query.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Build a retriever from a JSON array of passages
    /// (`[{"body": "...", "metadata": {"title": "..."}}, ...]`).
    pub fn from_json(json: &str) -> Result<Self, RetrievalError> {
        let passages: Vec<Passage> =
            serde_json::from_str(json).map_err(|e| RetrievalError::CorpusParse {
                message: e.to_string(),
            })?;
        Ok(Self::new(passages))
    }

    /// Build a retriever from a JSON corpus file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SibylError> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Score a passage against query words: one point per word found in the
    /// body, two per word found in the title, normalized by query length.
    fn score(passage: &Passage, query_words: &[&str]) -> f32 {
        let body_lower = passage.body.to_lowercase();
        let title_lower = passage
            .metadata
            .get("title")
            .map(|t| t.to_lowercase())
            .unwrap_or_default();

        let mut score = 0.0f32;
        for word in query_words {
            if body_lower.contains(word) {
                score += 1.0;
            }
            if title_lower.contains(word) {
                score += 2.0;
            }
        }
        score / query_words.len().max(1) as f32
    }
}

#[async_trait::async_trait]
impl Retriever for InMemoryRetriever {
    async fn search(&self, query: &str) -> Result<Vec<Passage>, RetrievalError> {
        let query_lower = query.to_lowercase();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();

        let mut scored: Vec<(f32, Passage)> = self
            .passages
            .iter()
            .map(|p| {
                let score = Self::score(p, &query_words);
                let mut passage = p.clone();
                passage.score = Some(score);
                (score, passage)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let results: Vec<Passage> = scored
            .into_iter()
            .take(self.limit)
            .map(|(_, p)| p)
            .collect();

        debug!(
            query = %query,
            corpus = self.passages.len(),
            matched = results.len(),
            "In-memory retrieval complete"
        );
        Ok(results)
    }
}

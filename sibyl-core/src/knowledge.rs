//! General-knowledge lookup collaborator.
//!
//! Backs the agent's knowledge-search tool. `WikipediaClient` queries the
//! MediaWiki search API; `StaticKnowledgeSource` is a deterministic double
//! for tests and offline runs.

use crate::error::ToolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// One result from a knowledge lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub title: String,
    pub summary: String,
}

/// An external knowledge-lookup service.
#[async_trait::async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Return up to `limit` entries for the query, best match first.
    async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, ToolError>;

    /// Short name of this source, used in error reports.
    fn name(&self) -> &str;
}

/// Knowledge source backed by the MediaWiki search API.
pub struct WikipediaClient {
    client: reqwest::Client,
    base_url: String,
}

impl WikipediaClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://en.wikipedia.org/w/api.php";

    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different MediaWiki endpoint
    /// (another language edition, or a test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn search_url(&self, query: &str, limit: usize) -> String {
        format!(
            "{}?action=query&list=search&srsearch={}&srlimit={}&format=json&utf8=1",
            self.base_url,
            urlencoding::encode(query),
            limit
        )
    }

    /// Extract entries from a MediaWiki search response body.
    fn parse_results(body: &Value, limit: usize) -> Vec<KnowledgeEntry> {
        body.get("query")
            .and_then(|q| q.get("search"))
            .and_then(|s| s.as_array())
            .map(|results| {
                results
                    .iter()
                    .take(limit)
                    .filter_map(|r| {
                        let title = r.get("title")?.as_str()?.to_string();
                        let snippet = r.get("snippet").and_then(|s| s.as_str()).unwrap_or("");
                        Some(KnowledgeEntry {
                            title,
                            summary: strip_html(snippet),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for WikipediaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl KnowledgeSource for WikipediaClient {
    async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, ToolError> {
        let url = self.search_url(query, limit);
        debug!(query = %query, limit = limit, "Wikipedia search");

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    name: self.name().to_string(),
                    message: format!("Request failed: {}", e),
                })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::ExecutionFailed {
                name: self.name().to_string(),
                message: format!("HTTP {}", status),
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                message: format!("Invalid JSON: {}", e),
            })?;

        Ok(Self::parse_results(&body, limit))
    }

    fn name(&self) -> &str {
        "wikipedia"
    }
}

/// Fixed-entry knowledge source for tests and offline runs.
///
/// Matches entries whose title or summary contains any query word
/// (case-insensitive), preserving insertion order.
pub struct StaticKnowledgeSource {
    entries: Vec<KnowledgeEntry>,
}

impl StaticKnowledgeSource {
    pub fn new(entries: Vec<KnowledgeEntry>) -> Self {
        Self { entries }
    }

    pub fn entry(title: &str, summary: &str) -> KnowledgeEntry {
        KnowledgeEntry {
            title: title.to_string(),
            summary: summary.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl KnowledgeSource for StaticKnowledgeSource {
    async fn lookup(&self, query: &str, limit: usize) -> Result<Vec<KnowledgeEntry>, ToolError> {
        let query_lower = query.to_lowercase();
        let words: Vec<&str> = query_lower.split_whitespace().collect();

        let matches: Vec<KnowledgeEntry> = self
            .entries
            .iter()
            .filter(|e| {
                let haystack = format!("{} {}", e.title, e.summary).to_lowercase();
                words.iter().any(|w| haystack.contains(w))
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(matches)
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Remove HTML tags and unescape the entities MediaWiki snippets carry.
fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

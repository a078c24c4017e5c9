//! Tool abstraction for the reasoning loop.
//!
//! Tools are named callables the agent can invoke between model turns. The
//! registry maps tool names to implementations and produces the definitions
//! advertised to the model. Two built-ins cover the pipeline's needs:
//! corpus search over the retrieval collaborator and general-knowledge
//! search over a [`KnowledgeSource`].

use crate::error::ToolError;
use crate::knowledge::KnowledgeSource;
use crate::retriever::Retriever;
use crate::types::ToolDefinition;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A named callable capability exposed to the reasoning loop.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema describing the tool's arguments.
    fn parameters(&self) -> Value;

    /// Run the tool. The output string is fed back to the model verbatim.
    async fn execute(&self, arguments: &Value) -> Result<String, ToolError>;

    /// The definition advertised to the model.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Registry mapping tool names to implementations.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions for every registered tool, sorted by name so requests
    /// are deterministic.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a registered tool by name.
    pub async fn execute(&self, name: &str, arguments: &Value) -> Result<String, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound {
            name: name.to_string(),
        })?;
        debug!(tool = name, "Executing tool");
        tool.execute(arguments).await
    }
}

/// Extract the required string argument `key` from tool arguments.
fn require_str_arg<'a>(arguments: &'a Value, tool: &str, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidArguments {
            name: tool.to_string(),
            reason: format!("{} is required", key),
        })
}

/// Searches the retrieval collaborator and formats passages for the model.
pub struct CorpusSearchTool {
    retriever: Arc<dyn Retriever>,
}

impl CorpusSearchTool {
    pub const NAME: &'static str = "corpus_search";

    /// Passages included in one tool response, at most.
    const MAX_PASSAGES: usize = 8;

    pub fn new(retriever: Arc<dyn Retriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait::async_trait]
impl Tool for CorpusSearchTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Fetch passages from the indexed corpus."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query for the corpus"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String, ToolError> {
        let query = require_str_arg(arguments, Self::NAME, "query")?;

        let docs = self
            .retriever
            .search(query)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: Self::NAME.to_string(),
                message: e.to_string(),
            })?;

        if docs.is_empty() {
            return Ok("No documents found.".to_string());
        }

        let merged: Vec<String> = docs
            .iter()
            .take(Self::MAX_PASSAGES)
            .enumerate()
            .map(|(i, doc)| format!("[{}] {}\n{}", i + 1, doc.display_title(i + 1), doc.body))
            .collect();
        Ok(merged.join("\n\n"))
    }
}

/// Searches an external knowledge source for general-knowledge questions.
pub struct KnowledgeSearchTool {
    source: Arc<dyn KnowledgeSource>,
    top_results: usize,
}

impl KnowledgeSearchTool {
    pub const NAME: &'static str = "knowledge_search";

    /// Entries requested per lookup unless overridden.
    pub const DEFAULT_TOP_RESULTS: usize = 3;

    pub fn new(source: Arc<dyn KnowledgeSource>) -> Self {
        Self {
            source,
            top_results: Self::DEFAULT_TOP_RESULTS,
        }
    }

    /// Cap the number of entries requested per lookup.
    pub fn with_top_results(mut self, top_results: usize) -> Self {
        self.top_results = top_results.max(1);
        self
    }
}

#[async_trait::async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Search external general knowledge (Wikipedia)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Topic to look up"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: &Value) -> Result<String, ToolError> {
        let query = require_str_arg(arguments, Self::NAME, "query")?;
        let entries = self.source.lookup(query, self.top_results).await?;

        if entries.is_empty() {
            return Ok("No results found.".to_string());
        }

        let merged: Vec<String> = entries
            .iter()
            .map(|e| format!("{}: {}", e.title, e.summary))
            .collect();
        Ok(merged.join("\n\n"))
    }
}

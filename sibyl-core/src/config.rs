//! Configuration system for Sibyl.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> CLI overrides. Configuration is loaded from
//! `~/.config/sibyl/config.toml` and/or `.sibyl/config.toml` in the
//! workspace directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the Sibyl pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SibylConfig {
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentLoopConfig,
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai", "mock", or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Default temperature for generation.
    pub temperature: f32,
    /// Optional per-request timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 4096,
            temperature: 0.7,
            timeout_secs: None,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    ///
    /// Returns an empty Vec if the config is valid. Returns human-readable
    /// warning messages for problematic values (does not error).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_tokens == 0 {
            warnings.push("max_tokens is 0; responses will be empty".to_string());
        }
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "temperature ({}) is outside the typical range 0.0-2.0",
                self.temperature
            ));
        }
        warnings
    }
}

/// Retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Path to a JSON corpus file loaded into the in-memory retriever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_path: Option<PathBuf>,
    /// Maximum passages returned per query.
    pub limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            corpus_path: None,
            limit: 4,
        }
    }
}

/// Reasoning-loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    /// Whether generation runs through the tool-calling agent.
    pub enabled: bool,
    /// Maximum reasoning iterations per question.
    pub max_iterations: usize,
    /// Number of knowledge-lookup results per query.
    pub knowledge_results: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 10,
            knowledge_results: 3,
        }
    }
}

impl SibylConfig {
    /// Validate the entire config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for w in self.llm.validate() {
            warnings.push(format!("[llm] {}", w));
        }
        if self.retrieval.limit == 0 {
            warnings.push("[retrieval] limit is 0; every query will return no passages".to_string());
        }
        if self.agent.enabled && self.agent.max_iterations == 0 {
            warnings.push("[agent] max_iterations is 0; the reasoning loop will never run".to_string());
        }
        warnings
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `SIBYL_`)
/// 3. Workspace-local config (`.sibyl/config.toml`)
/// 4. User config (`~/.config/sibyl/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&SibylConfig>,
) -> Result<SibylConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(SibylConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "sibyl", "sibyl") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".sibyl").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (SIBYL_LLM__MODEL, SIBYL_AGENT__MAX_ITERATIONS, etc.)
    figment = figment.merge(Env::prefixed("SIBYL_").split("__"));

    // Explicit overrides
    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Check whether any Sibyl configuration file exists (user-level or
/// workspace-level).
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "sibyl", "sibyl") {
        if config_dir.config_dir().join("config.toml").exists() {
            return true;
        }
    }

    if let Some(ws) = workspace {
        if ws.join(".sibyl").join("config.toml").exists() {
            return true;
        }
    }

    false
}

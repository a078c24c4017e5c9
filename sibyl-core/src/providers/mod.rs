//! LLM provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait for
//! OpenAI-compatible APIs (OpenAI, Azure, Ollama, vLLM, LM Studio).
//!
//! Use `create_provider()` to instantiate the appropriate provider based on config.

pub mod openai_compat;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{LlmProvider, MockLlmProvider};
use std::sync::Arc;

pub use openai_compat::OpenAiCompatibleProvider;

/// Create an LLM provider based on the configuration.
///
/// Routes to the appropriate provider implementation:
/// - `"mock"` → `MockLlmProvider` (offline demos and tests, no API key)
/// - Everything else → `OpenAiCompatibleProvider` (OpenAI, Azure, Ollama, local, etc.)
///
/// Returns an error if the provider cannot be initialized.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmProvider::new())),
        _ => Ok(Arc::new(OpenAiCompatibleProvider::new(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: "test-model".to_string(),
            api_key_env: "SIBYL_TEST_FACTORY_KEY".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_provider_openai() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::set_var("SIBYL_TEST_FACTORY_KEY", "test-key-123") };
        let config = test_config("openai");
        let result = create_provider(&config);
        assert!(result.is_ok());
        let provider = result.unwrap();
        assert_eq!(provider.model_name(), "test-model");
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_FACTORY_KEY") };
    }

    #[test]
    fn test_create_provider_unknown_defaults_to_openai_compat() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::set_var("SIBYL_TEST_FACTORY_KEY", "test-key-789") };
        let config = test_config("groq");
        let result = create_provider(&config);
        assert!(result.is_ok());
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_FACTORY_KEY") };
    }

    #[test]
    fn test_create_provider_mock_needs_no_key() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_TEST_MOCK_KEY_UNSET") };
        let mut config = test_config("mock");
        config.api_key_env = "SIBYL_TEST_MOCK_KEY_UNSET".to_string();
        let result = create_provider(&config);
        assert!(result.is_ok());
    }

    #[test]
    fn test_create_provider_missing_key() {
        // SAFETY: test-only env var manipulation
        unsafe { std::env::remove_var("SIBYL_NONEXISTENT_FACTORY_KEY") };
        let mut config = test_config("openai");
        config.api_key_env = "SIBYL_NONEXISTENT_FACTORY_KEY".to_string();
        let result = create_provider(&config);
        assert!(result.is_err());
        match result.err().unwrap() {
            LlmError::AuthFailed { provider } => {
                assert!(provider.contains("SIBYL_NONEXISTENT_FACTORY_KEY"));
            }
            other => panic!("Expected AuthFailed, got {:?}", other),
        }
    }
}

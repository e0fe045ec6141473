//! The LLM boundary. Every call into a generative collaborator goes through
//! this trait; the engine itself never constructs a concrete client.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("llm unavailable")]
    Unavailable,
    #[error("llm returned invalid json: {0}")]
    InvalidResponse(String),
    #[error("llm request timed out")]
    Timeout,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_json(&self, prompt: &str) -> Result<serde_json::Value, LlmError>;
}

/// Always degrades. Used as the harness default and in every test that
/// exercises an LLM-degradation path.
pub struct NullLlmClient;

#[async_trait]
impl LlmClient for NullLlmClient {
    async fn generate_json(&self, _prompt: &str) -> Result<serde_json::Value, LlmError> {
        Err(LlmError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_client_always_degrades() {
        let client = NullLlmClient;
        let result = client.generate_json("anything").await;
        assert!(matches!(result, Err(LlmError::Unavailable)));
    }
}

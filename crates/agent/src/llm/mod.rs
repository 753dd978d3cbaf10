//! Provider adapters.
//!
//! Each adapter translates the internal transcript and tool catalog into one
//! vendor's wire format and maps the vendor reply back onto
//! [`NormalizedResponse`]. Adapters never return errors to the engine:
//! transport, API and decoding failures become a final text reply.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use stockpilot_core::config::{LlmConfig, LlmProvider};

use crate::conversation::{Message, ToolInvocationRequest};

pub mod anthropic;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

#[derive(Clone, Debug, PartialEq)]
pub enum NormalizedResponse {
    FinalText(Option<String>),
    ToolRequests { content: Option<String>, requests: Vec<ToolInvocationRequest> },
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("could not build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Tool catalog in this vendor's schema; empty when tools are unsupported.
    fn describe_tools(&self) -> Vec<Value>;

    async fn send(&self, transcript: &[Message]) -> NormalizedResponse;
}

pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    Ok(match config.provider {
        LlmProvider::OpenAi => Arc::new(OpenAiClient::new(config)?),
        LlmProvider::Anthropic => Arc::new(AnthropicClient::new(config)?),
        LlmProvider::Ollama => Arc::new(OllamaClient::new(config)?),
    })
}

pub(crate) fn failure_response(provider: &'static str, error: &LlmError) -> NormalizedResponse {
    error!(
        event_name = "llm.request.failed",
        provider,
        error = %error,
        "llm request failed"
    );
    NormalizedResponse::FinalText(Some(format!("对话失败: {error}")))
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(LlmError::ClientBuild)
}

pub(crate) async fn read_json(response: reqwest::Response) -> Result<Value, LlmError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Api { status: status.as_u16(), body });
    }
    response.json::<Value>().await.map_err(LlmError::Transport)
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use stockpilot_core::config::{LlmConfig, LlmProvider};

    use super::{build_client, endpoint, failure_response, LlmError, NormalizedResponse};

    fn config(provider: LlmProvider) -> LlmConfig {
        LlmConfig {
            provider,
            api_key: Some(SecretString::from("sk-test".to_string())),
            base_url: Some("http://localhost:11434".to_string()),
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_tokens: 1024,
        }
    }

    #[test]
    fn build_client_selects_the_configured_vendor() {
        for (provider, name, tools) in [
            (LlmProvider::OpenAi, "openai", 6),
            (LlmProvider::Anthropic, "anthropic", 6),
            (LlmProvider::Ollama, "ollama", 0),
        ] {
            let client = build_client(&config(provider)).expect("client");
            assert_eq!(client.provider(), name);
            assert_eq!(client.describe_tools().len(), tools);
        }
    }

    #[test]
    fn failures_become_final_text() {
        let response = failure_response(
            "openai",
            &LlmError::Api { status: 401, body: "invalid key".to_string() },
        );
        assert_eq!(
            response,
            NormalizedResponse::FinalText(Some(
                "对话失败: API returned status 401: invalid key".to_string()
            ))
        );
    }

    #[test]
    fn endpoints_join_without_double_slashes() {
        assert_eq!(
            endpoint("https://api.openai.com/v1/", "/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}

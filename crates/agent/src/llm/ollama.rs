use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use stockpilot_core::config::LlmConfig;

use super::{
    endpoint, failure_response, http_client, read_json, LlmClient, LlmError, NormalizedResponse,
};
use crate::conversation::Message;

/// Local Ollama server. No tool support: every reply is final text.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let base_url = config.base_url.clone().ok_or(LlmError::MissingConfig("llm.base_url"))?;
        Ok(Self { http: http_client(config.timeout_secs)?, base_url, model: config.model.clone() })
    }

    async fn complete(&self, transcript: &[Message]) -> Result<NormalizedResponse, LlmError> {
        let body = build_request_body(&self.model, transcript);
        let response =
            self.http.post(endpoint(&self.base_url, "api/chat")).json(&body).send().await?;

        let reply = read_json(response).await?;
        debug!(event_name = "llm.response.received", provider = "ollama", "chat reply received");
        parse_response(&reply)
    }
}

pub fn build_request_body(model: &str, transcript: &[Message]) -> Value {
    let messages: Vec<Value> = transcript
        .iter()
        .filter_map(|message| match message {
            Message::System { content } => Some(json!({ "role": "system", "content": content })),
            Message::User { content } => Some(json!({ "role": "user", "content": content })),
            Message::Assistant { content, .. } => content
                .as_deref()
                .map(|text| json!({ "role": "assistant", "content": text })),
            Message::ToolResult { content, .. } => {
                Some(json!({ "role": "tool", "content": content }))
            }
        })
        .collect();

    json!({ "model": model, "messages": messages, "stream": false })
}

pub fn parse_response(reply: &Value) -> Result<NormalizedResponse, LlmError> {
    reply
        .pointer("/message/content")
        .and_then(Value::as_str)
        .map(|content| NormalizedResponse::FinalText(Some(content.to_string())))
        .ok_or_else(|| LlmError::InvalidResponse("missing message.content".to_string()))
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn provider(&self) -> &'static str {
        "ollama"
    }

    fn describe_tools(&self) -> Vec<Value> {
        Vec::new()
    }

    async fn send(&self, transcript: &[Message]) -> NormalizedResponse {
        match self.complete(transcript).await {
            Ok(response) => response,
            Err(error) => failure_response(self.provider(), &error),
        }
    }
}

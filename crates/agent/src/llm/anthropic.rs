use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::debug;

use stockpilot_core::config::LlmConfig;

use super::{
    endpoint, failure_response, http_client, read_json, LlmClient, LlmError, NormalizedResponse,
};
use crate::conversation::{Message, ToolArguments, ToolInvocationRequest};
use crate::tools::catalog;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

/// Messages API adapter. System prompts travel in the top-level `system`
/// field; tool results are sent back as `tool_result` blocks in user turns.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    tools: Vec<Value>,
}

impl AnthropicClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingConfig("llm.api_key"))?;
        Ok(Self {
            http: http_client(config.timeout_secs)?,
            base_url: config.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            tools: tool_schemas(),
        })
    }

    async fn complete(&self, transcript: &[Message]) -> Result<NormalizedResponse, LlmError> {
        let body = build_request_body(&self.model, self.max_tokens, &self.tools, transcript);
        let response = self
            .http
            .post(endpoint(&self.base_url, "v1/messages"))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let reply = read_json(response).await?;
        let stop_reason = reply.get("stop_reason").and_then(Value::as_str).unwrap_or("none");
        debug!(
            event_name = "llm.response.received",
            provider = "anthropic",
            stop_reason,
            "messages response received"
        );
        parse_response(&reply)
    }
}

pub fn tool_schemas() -> Vec<Value> {
    catalog::definitions()
        .iter()
        .map(|definition| {
            json!({
                "name": definition.name,
                "description": definition.description,
                "input_schema": definition.parameters,
            })
        })
        .collect()
}

/// Splits the transcript into the top-level system prompt and the message
/// list. Consecutive tool results share one user message.
pub fn wire_messages(transcript: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    let mut open_tool_results: Option<Vec<Value>> = None;

    for message in transcript {
        if let Message::ToolResult { invocation_id, content } = message {
            open_tool_results.get_or_insert_with(Vec::new).push(json!({
                "type": "tool_result",
                "tool_use_id": invocation_id,
                "content": content,
            }));
            continue;
        }
        if let Some(results) = open_tool_results.take() {
            messages.push(json!({ "role": "user", "content": results }));
        }

        match message {
            Message::System { content } => system_parts.push(content),
            Message::User { content } => messages.push(json!({ "role": "user", "content": content })),
            Message::Assistant { content, tool_calls } if tool_calls.is_empty() => {
                if let Some(text) = content.as_deref().filter(|text| !text.is_empty()) {
                    messages.push(json!({ "role": "assistant", "content": text }));
                }
            }
            Message::Assistant { content, tool_calls } => {
                let mut blocks = Vec::with_capacity(tool_calls.len() + 1);
                if let Some(text) = content.as_deref().filter(|text| !text.is_empty()) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                blocks.extend(tool_calls.iter().map(|call| {
                    json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments.to_value(),
                    })
                }));
                messages.push(json!({ "role": "assistant", "content": blocks }));
            }
            Message::ToolResult { .. } => {}
        }
    }
    if let Some(results) = open_tool_results {
        messages.push(json!({ "role": "user", "content": results }));
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, messages)
}

pub fn build_request_body(
    model: &str,
    max_tokens: u32,
    tools: &[Value],
    transcript: &[Message],
) -> Value {
    let (system, messages) = wire_messages(transcript);
    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });
    if let Some(system) = system {
        body["system"] = json!(system);
    }
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
    }
    body
}

pub fn parse_response(reply: &Value) -> Result<NormalizedResponse, LlmError> {
    let blocks = reply
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::InvalidResponse("missing content blocks".to_string()))?;

    let mut text = String::new();
    let mut requests = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or_default()),
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).ok_or_else(|| {
                    LlmError::InvalidResponse("tool_use block without id".to_string())
                })?;
                let name = block.get("name").and_then(Value::as_str).ok_or_else(|| {
                    LlmError::InvalidResponse(format!("tool_use block {id} without name"))
                })?;
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                requests.push(ToolInvocationRequest::new(id, name, ToolArguments::from_value(input)));
            }
            _ => {}
        }
    }

    let stop_reason = reply.get("stop_reason").and_then(Value::as_str).unwrap_or("none");
    Ok(match stop_reason {
        "end_turn" => NormalizedResponse::FinalText(Some(text)),
        "tool_use" if !requests.is_empty() => NormalizedResponse::ToolRequests {
            content: (!text.is_empty()).then_some(text),
            requests,
        },
        other if text.is_empty() => {
            NormalizedResponse::FinalText(Some(format!("模型未返回文本内容 (stop_reason: {other})")))
        }
        _ => NormalizedResponse::FinalText(Some(text)),
    })
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn describe_tools(&self) -> Vec<Value> {
        self.tools.clone()
    }

    async fn send(&self, transcript: &[Message]) -> NormalizedResponse {
        match self.complete(transcript).await {
            Ok(response) => response,
            Err(error) => failure_response(self.provider(), &error),
        }
    }
}

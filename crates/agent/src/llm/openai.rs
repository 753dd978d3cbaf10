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

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible `chat/completions` adapter with native function calling.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    tools: Vec<Value>,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or(LlmError::MissingConfig("llm.api_key"))?;
        Ok(Self {
            http: http_client(config.timeout_secs)?,
            base_url: config.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model: config.model.clone(),
            tools: catalog::function_schemas(),
        })
    }

    async fn complete(&self, transcript: &[Message]) -> Result<NormalizedResponse, LlmError> {
        let body = build_request_body(&self.model, &self.tools, transcript);
        let response = self
            .http
            .post(endpoint(&self.base_url, "chat/completions"))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?;

        let reply = read_json(response).await?;
        debug!(event_name = "llm.response.received", provider = "openai", "chat completion received");
        parse_response(&reply)
    }
}

pub fn wire_messages(transcript: &[Message]) -> Vec<Value> {
    transcript
        .iter()
        .map(|message| match message {
            Message::System { content } => json!({ "role": "system", "content": content }),
            Message::User { content } => json!({ "role": "user", "content": content }),
            Message::Assistant { content, tool_calls } if tool_calls.is_empty() => {
                json!({ "role": "assistant", "content": content })
            }
            Message::Assistant { content, tool_calls } => json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls
                    .iter()
                    .map(|call| json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.wire_arguments() },
                    }))
                    .collect::<Vec<_>>(),
            }),
            Message::ToolResult { invocation_id, content } => json!({
                "role": "tool",
                "tool_call_id": invocation_id,
                "content": content,
            }),
        })
        .collect()
}

pub fn build_request_body(model: &str, tools: &[Value], transcript: &[Message]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": wire_messages(transcript),
    });
    if !tools.is_empty() {
        body["tools"] = Value::Array(tools.to_vec());
        body["tool_choice"] = json!("auto");
    }
    body
}

fn parse_tool_call(call: &Value) -> Result<ToolInvocationRequest, LlmError> {
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::InvalidResponse("tool call without id".to_string()))?;
    let name = call
        .pointer("/function/name")
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::InvalidResponse(format!("tool call {id} without name")))?;

    Ok(match call.pointer("/function/arguments") {
        Some(Value::String(raw)) => ToolInvocationRequest::from_json_arguments(id, name, raw.as_str()),
        Some(other) => ToolInvocationRequest::new(id, name, ToolArguments::from_value(other.clone())),
        None => ToolInvocationRequest::new(id, name, ToolArguments::Parsed(Default::default())),
    })
}

pub fn parse_response(reply: &Value) -> Result<NormalizedResponse, LlmError> {
    let message = reply
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".to_string()))?;
    let content = message.get("content").and_then(Value::as_str).map(str::to_string);

    let calls = message.get("tool_calls").and_then(Value::as_array).filter(|calls| !calls.is_empty());
    let Some(calls) = calls else {
        return Ok(NormalizedResponse::FinalText(content));
    };

    let requests = calls.iter().map(parse_tool_call).collect::<Result<Vec<_>, _>>()?;
    Ok(NormalizedResponse::ToolRequests { content, requests })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> &'static str {
        "openai"
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

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{build_request_body, parse_response};
    use crate::conversation::{Message, ToolArguments, ToolInvocationRequest};
    use crate::llm::NormalizedResponse;
    use crate::tools::catalog;

    #[test]
    fn request_body_carries_tools_and_echoes_tool_calls() {
        let transcript = vec![
            Message::system("你是股票助手"),
            Message::user("查询 600000"),
            Message::Assistant {
                content: None,
                tool_calls: vec![ToolInvocationRequest::from_json_arguments(
                    "call_1",
                    "get_stock_detail",
                    "{\"stock_code\": \"600000\"}",
                )],
            },
            Message::ToolResult {
                invocation_id: "call_1".to_string(),
                content: "{\"success\":true}".to_string(),
            },
        ];

        let body = build_request_body("gpt-4-turbo-preview", &catalog::function_schemas(), &transcript);

        assert_eq!(body["tool_choice"], json!("auto"));
        assert_eq!(body["tools"].as_array().map(Vec::len), Some(6));
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            json!("{\"stock_code\": \"600000\"}")
        );
        assert_eq!(messages[3], json!({"role": "tool", "tool_call_id": "call_1", "content": "{\"success\":true}"}));
    }

    #[test]
    fn empty_tool_calls_mean_final_text() {
        let reply = json!({"choices": [{"message": {"role": "assistant", "content": "好的", "tool_calls": []}}]});
        assert_eq!(
            parse_response(&reply).expect("parse"),
            NormalizedResponse::FinalText(Some("好的".to_string()))
        );

        let null_content = json!({"choices": [{"message": {"role": "assistant", "content": null}}]});
        assert_eq!(parse_response(&null_content).expect("parse"), NormalizedResponse::FinalText(None));
    }

    #[test]
    fn tool_calls_are_parsed_and_malformed_arguments_recorded() {
        let reply = json!({"choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [
                {"id": "call_a", "type": "function", "function": {"name": "search_stock", "arguments": "{\"keyword\":\"银行\"}"}},
                {"id": "call_b", "type": "function", "function": {"name": "get_stock_detail", "arguments": "{invalid json"}}
            ]
        }}]});

        let NormalizedResponse::ToolRequests { content, requests } = parse_response(&reply).expect("parse") else {
            panic!("expected tool requests");
        };
        assert_eq!(content, None);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].id, "call_a");
        assert!(matches!(requests[0].arguments, ToolArguments::Parsed(_)));
        assert!(matches!(requests[1].arguments, ToolArguments::Malformed { .. }));
        assert_eq!(requests[1].wire_arguments(), "{invalid json");
    }

    #[test]
    fn missing_choices_is_an_invalid_response() {
        assert!(parse_response(&json!({"error": "boom"})).is_err());
    }
}

//! Transcript types shared by the runtime, the tool dispatcher and every
//! provider adapter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of a transcript. The transcript is append-only for the
/// duration of a single chat call.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant { content: Option<String>, tool_calls: Vec<ToolInvocationRequest> },
    ToolResult { invocation_id: String, content: String },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User { content: content.into() }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant { content: Some(content.into()), tool_calls: Vec::new() }
    }
}

/// A vendor-issued request to run one tool. `id` is opaque and only
/// meaningful to the vendor that issued it.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocationRequest {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
    /// The exact argument text the vendor sent, when it sent text.
    pub raw_arguments: Option<String>,
}

impl ToolInvocationRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self { id: id.into(), name: name.into(), arguments, raw_arguments: None }
    }

    /// Builds a request from a JSON-encoded argument string, keeping the
    /// original text for echoing back to the vendor.
    pub fn from_json_arguments(
        id: impl Into<String>,
        name: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        let raw = raw.into();
        Self {
            id: id.into(),
            name: name.into(),
            arguments: ToolArguments::from_json_str(&raw),
            raw_arguments: Some(raw),
        }
    }

    pub fn wire_arguments(&self) -> String {
        self.raw_arguments.clone().unwrap_or_else(|| self.arguments.to_wire_string())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ToolArguments {
    Parsed(Map<String, Value>),
    Malformed { raw: String, error: String },
}

impl ToolArguments {
    pub fn from_json_str(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::Parsed(Map::new());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(error) => Self::Malformed { raw: raw.to_string(), error: error.to_string() },
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Parsed(map),
            Value::Null => Self::Parsed(Map::new()),
            other => Self::Malformed {
                raw: other.to_string(),
                error: "arguments must be a JSON object".to_string(),
            },
        }
    }

    pub fn to_wire_string(&self) -> String {
        match self {
            Self::Parsed(map) => Value::Object(map.clone()).to_string(),
            Self::Malformed { raw, .. } => raw.clone(),
        }
    }

    /// Structured form for vendors that take arguments as an object.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Parsed(map) => Value::Object(map.clone()),
            Self::Malformed { .. } => Value::Object(Map::new()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Caller-facing message shape: `{"role": "...", "content": "..."}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl From<ChatMessage> for Message {
    fn from(message: ChatMessage) -> Self {
        match message.role {
            ChatRole::System => Message::System { content: message.content },
            ChatRole::User => Message::User { content: message.content },
            ChatRole::Assistant => {
                Message::Assistant { content: Some(message.content), tool_calls: Vec::new() }
            }
        }
    }
}

/// Caller-facing result of one chat call. `tool_calls` is always null; tool
/// activity stays inside the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<Value>>,
}

impl ChatReply {
    pub fn text(content: Option<String>) -> Self {
        Self { content, tool_calls: None }
    }
}

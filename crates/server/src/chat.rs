use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use stockpilot_agent::tools::catalog;
use stockpilot_agent::{AgentRuntime, ChatMessage};

#[derive(Clone)]
pub struct ChatState {
    runtime: Arc<AgentRuntime>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Accepted for compatibility; replies are never streamed.
    #[serde(default)]
    pub stream: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub success: bool,
    pub message: AssistantMessage,
    pub tool_calls: Option<Vec<Value>>,
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/tools", get(tools))
        .with_state(ChatState { runtime })
}

pub async fn chat(
    State(state): State<ChatState>,
    Json(request): Json<ChatRequest>,
) -> (StatusCode, Json<Value>) {
    if request.messages.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "success": false, "message": "messages 不能为空" })),
        );
    }

    let correlation_id = Uuid::new_v4().to_string();
    info!(
        event_name = "server.chat.received",
        correlation_id = %correlation_id,
        messages = request.messages.len(),
        stream_requested = request.stream,
        "chat request received"
    );

    let reply = state.runtime.chat(request.messages).await;
    info!(
        event_name = "server.chat.completed",
        correlation_id = %correlation_id,
        has_content = reply.content.is_some(),
        "chat request completed"
    );

    let response = ChatResponse {
        success: true,
        message: AssistantMessage { role: "assistant", content: reply.content },
        tool_calls: reply.tool_calls,
    };
    (StatusCode::OK, Json(json!(response)))
}

pub async fn tools() -> Json<Value> {
    Json(json!({ "success": true, "tools": catalog::function_schemas() }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use stockpilot_agent::{
        AgentRuntime, LlmClient, Message, NormalizedResponse, SqlGuardPolicy, ToolRegistry,
    };
    use stockpilot_db::InMemoryStockRepository;

    use super::router;

    /// Echoes the last user message back as final text.
    struct EchoClient;

    #[async_trait]
    impl LlmClient for EchoClient {
        fn provider(&self) -> &'static str {
            "echo"
        }

        fn describe_tools(&self) -> Vec<Value> {
            Vec::new()
        }

        async fn send(&self, transcript: &[Message]) -> NormalizedResponse {
            let last_user = transcript.iter().rev().find_map(|message| match message {
                Message::User { content } => Some(format!("收到: {content}")),
                _ => None,
            });
            NormalizedResponse::FinalText(last_user)
        }
    }

    fn app() -> axum::Router {
        let tools = ToolRegistry::stock_tools(
            Arc::new(InMemoryStockRepository::default()),
            SqlGuardPolicy::default(),
        );
        router(Arc::new(AgentRuntime::new(Arc::new(EchoClient), Arc::new(tools), 5)))
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.expect("router responds");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body bytes");
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::post("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn chat_wraps_the_reply_in_an_assistant_message() {
        let (status, body) = send(post_json(json!({
            "messages": [{"role": "user", "content": "查询 600000"}],
            "stream": false
        })))
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "success": true,
                "message": {"role": "assistant", "content": "收到: 查询 600000"},
                "tool_calls": null
            })
        );
    }

    #[tokio::test]
    async fn unknown_roles_are_rejected_by_the_extractor() {
        let (status, _) =
            send(post_json(json!({"messages": [{"role": "tool", "content": "x"}]}))).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn empty_conversations_are_rejected() {
        let (status, body) = send(post_json(json!({"messages": []}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn tools_lists_the_catalog() {
        let request = Request::get("/api/tools").body(Body::empty()).expect("request");
        let (status, body) = send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        let tools = body["tools"].as_array().cloned().unwrap_or_default();
        assert_eq!(tools.len(), 6);
        assert!(tools.iter().any(|tool| tool["function"]["name"] == json!("execute_sql_query")));
    }
}

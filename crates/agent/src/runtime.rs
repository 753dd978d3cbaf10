use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::conversation::{ChatMessage, ChatReply, Message};
use crate::llm::{LlmClient, NormalizedResponse};
use crate::tools::ToolRegistry;

pub const ITERATION_LIMIT_MESSAGE: &str = "对话超过最大迭代次数";

/// Result of one conversation: the final text plus the full transcript that
/// produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatTurn {
    pub content: Option<String>,
    pub transcript: Vec<Message>,
    pub rounds: usize,
    pub dispatched: usize,
}

/// Bounded call-observe loop: each round makes exactly one model call and at
/// most one dispatch pass. Tool requests within a round run concurrently and
/// their results are appended in request order.
pub struct AgentRuntime {
    client: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
}

impl AgentRuntime {
    pub fn new(client: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>, max_iterations: usize) -> Self {
        Self { client, tools, max_iterations: max_iterations.max(1) }
    }

    pub fn provider(&self) -> &'static str {
        self.client.provider()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn chat(&self, messages: Vec<ChatMessage>) -> ChatReply {
        let transcript = messages.into_iter().map(Message::from).collect();
        ChatReply::text(self.run(transcript).await.content)
    }

    pub async fn run(&self, mut transcript: Vec<Message>) -> ChatTurn {
        let mut dispatched = 0;

        for round in 1..=self.max_iterations {
            info!(
                event_name = "agent.round.start",
                provider = self.client.provider(),
                round,
                transcript_len = transcript.len(),
                "requesting model response"
            );

            let (content, requests) = match self.client.send(&transcript).await {
                NormalizedResponse::ToolRequests { content, requests } if !requests.is_empty() => {
                    (content, requests)
                }
                NormalizedResponse::ToolRequests { content, .. }
                | NormalizedResponse::FinalText(content) => {
                    transcript.push(Message::Assistant {
                        content: content.clone(),
                        tool_calls: Vec::new(),
                    });
                    info!(
                        event_name = "agent.conversation.completed",
                        provider = self.client.provider(),
                        rounds = round,
                        dispatched,
                        "conversation finished with final text"
                    );
                    return ChatTurn { content, transcript, rounds: round, dispatched };
                }
            };

            let results =
                join_all(requests.iter().map(|request| self.tools.dispatch_request(request))).await;
            dispatched += results.len();
            let failed = results.iter().filter(|result| !result.success).count();
            info!(
                event_name = "agent.round.dispatched",
                provider = self.client.provider(),
                round,
                requested = results.len(),
                failed,
                "tool results appended"
            );

            transcript.push(Message::Assistant { content, tool_calls: requests });
            transcript.extend(results.into_iter().map(|result| Message::ToolResult {
                invocation_id: result.invocation_id,
                content: result.payload,
            }));
        }

        warn!(
            event_name = "agent.iterations.exhausted",
            provider = self.client.provider(),
            max_iterations = self.max_iterations,
            dispatched,
            "conversation hit the iteration cap"
        );
        ChatTurn {
            content: Some(ITERATION_LIMIT_MESSAGE.to_string()),
            transcript,
            rounds: self.max_iterations,
            dispatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{json, Value};

    use stockpilot_core::domain::stock::{
        IndustryCount, Stock, StockCode, StockCriteria, StockDaily, StockListQuery, StockPage,
    };
    use stockpilot_db::{
        InMemoryStockRepository, QueryRow, RepositoryError, StockRepository,
    };

    use super::{AgentRuntime, ITERATION_LIMIT_MESSAGE};
    use crate::conversation::{ChatMessage, Message, ToolArguments, ToolInvocationRequest};
    use crate::guardrails::SqlGuardPolicy;
    use crate::llm::{LlmClient, NormalizedResponse};
    use crate::tools::ToolRegistry;

    /// Replays scripted responses, then repeats `fallback` forever.
    struct ScriptedClient {
        script: Mutex<VecDeque<NormalizedResponse>>,
        fallback: NormalizedResponse,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<NormalizedResponse>, fallback: NormalizedResponse) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider(&self) -> &'static str {
            "scripted"
        }

        fn describe_tools(&self) -> Vec<Value> {
            Vec::new()
        }

        async fn send(&self, transcript: &[Message]) -> NormalizedResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(transcript.to_vec());
            }
            let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    /// Counts storage calls while delegating to an in-memory repository.
    #[derive(Default)]
    struct RecordingRepository {
        inner: InMemoryStockRepository,
        lookups: Mutex<HashMap<String, usize>>,
        total_calls: AtomicUsize,
    }

    impl RecordingRepository {
        fn lookups_for(&self, code: &str) -> usize {
            self.lookups.lock().map(|lookups| lookups.get(code).copied().unwrap_or(0)).unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.total_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StockRepository for RecordingRepository {
        async fn find_by_code(&self, code: &StockCode) -> Result<Option<Stock>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut lookups) = self.lookups.lock() {
                *lookups.entry(code.0.clone()).or_default() += 1;
            }
            self.inner.find_by_code(code).await
        }

        async fn search_by_keyword_or_name(
            &self,
            keyword: &str,
            limit: u32,
        ) -> Result<Vec<Stock>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.search_by_keyword_or_name(keyword, limit).await
        }

        async fn history_by_code_and_date_range(
            &self,
            code: &StockCode,
            start: NaiveDate,
            end: NaiveDate,
            limit: u32,
        ) -> Result<Vec<StockDaily>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.history_by_code_and_date_range(code, start, end, limit).await
        }

        async fn filter_by_criteria(
            &self,
            criteria: &StockCriteria,
            limit: u32,
        ) -> Result<Vec<Stock>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.filter_by_criteria(criteria, limit).await
        }

        async fn list_stocks(&self, query: &StockListQuery) -> Result<StockPage, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.list_stocks(query).await
        }

        async fn industry_counts(&self) -> Result<Vec<IndustryCount>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.industry_counts().await
        }

        async fn count_stocks(&self) -> Result<i64, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.count_stocks().await
        }

        async fn count_daily_records(&self) -> Result<i64, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.count_daily_records().await
        }

        async fn latest_trade_date(&self) -> Result<Option<NaiveDate>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.latest_trade_date().await
        }

        async fn execute_read_only(&self, sql: &str) -> Result<Vec<QueryRow>, RepositoryError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute_read_only(sql).await
        }
    }

    async fn seeded_repository() -> Arc<RecordingRepository> {
        let repository = Arc::new(RecordingRepository::default());
        repository
            .inner
            .insert_stock(Stock {
                code: StockCode("600000".to_string()),
                name: "浦发银行".to_string(),
                industry: Some("银行".to_string()),
                pe_ratio: Some(5.2),
                ..Stock::default()
            })
            .await;
        repository
    }

    fn runtime(
        client: Arc<ScriptedClient>,
        repository: Arc<RecordingRepository>,
        max_iterations: usize,
    ) -> AgentRuntime {
        let tools = ToolRegistry::stock_tools(repository, SqlGuardPolicy::default());
        AgentRuntime::new(client, Arc::new(tools), max_iterations)
    }

    fn request(id: &str, name: &str, arguments: Value) -> ToolInvocationRequest {
        ToolInvocationRequest::new(id, name, ToolArguments::from_value(arguments))
    }

    fn tool_requests(requests: Vec<ToolInvocationRequest>) -> NormalizedResponse {
        NormalizedResponse::ToolRequests { content: None, requests }
    }

    fn final_text(text: &str) -> NormalizedResponse {
        NormalizedResponse::FinalText(Some(text.to_string()))
    }

    fn tool_payloads(transcript: &[Message]) -> Vec<(String, Value)> {
        transcript
            .iter()
            .filter_map(|message| match message {
                Message::ToolResult { invocation_id, content } => Some((
                    invocation_id.clone(),
                    serde_json::from_str(content).unwrap_or(Value::Null),
                )),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn endless_tool_requests_stop_at_the_iteration_cap() {
        let client = ScriptedClient::new(
            Vec::new(),
            tool_requests(vec![request("call_x", "search_stock", json!({"keyword": "银行"}))]),
        );
        let runtime = runtime(client.clone(), seeded_repository().await, 5);

        let turn = runtime.run(vec![Message::user("一直查")]).await;

        assert_eq!(turn.content.as_deref(), Some(ITERATION_LIMIT_MESSAGE));
        assert_eq!(client.calls(), 5);
        assert_eq!(turn.rounds, 5);
        assert_eq!(turn.dispatched, 5);
    }

    #[tokio::test]
    async fn immediate_final_text_makes_one_call_and_no_dispatch() {
        let client = ScriptedClient::new(vec![final_text("你好")], final_text("unused"));
        let repository = seeded_repository().await;
        let runtime = runtime(client.clone(), repository.clone(), 5);

        let turn = runtime.run(vec![Message::user("你好")]).await;

        assert_eq!(turn.content.as_deref(), Some("你好"));
        assert_eq!(client.calls(), 1);
        assert_eq!(turn.dispatched, 0);
        assert_eq!(repository.total_calls(), 0);
        assert_eq!(turn.transcript.last(), Some(&Message::assistant_text("你好")));
    }

    #[tokio::test]
    async fn unknown_tools_fail_softly_and_the_loop_continues() {
        let client = ScriptedClient::new(
            vec![tool_requests(vec![request("call_1", "drop_table", json!({}))]), final_text("无法执行")],
            final_text("unused"),
        );
        let runtime = runtime(client.clone(), seeded_repository().await, 5);

        let turn = runtime.run(vec![Message::user("删掉表")]).await;

        let payloads = tool_payloads(&turn.transcript);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].1["success"], json!(false));
        assert_eq!(payloads[0].1["message"], json!("未知的工具: drop_table"));
        assert_eq!(client.calls(), 2);
        assert_eq!(turn.content.as_deref(), Some("无法执行"));
    }

    #[tokio::test]
    async fn malformed_arguments_fail_softly() {
        let client = ScriptedClient::new(
            vec![
                tool_requests(vec![ToolInvocationRequest::from_json_arguments(
                    "call_1",
                    "get_stock_detail",
                    "{invalid json",
                )]),
                final_text("参数错误"),
            ],
            final_text("unused"),
        );
        let repository = seeded_repository().await;
        let runtime = runtime(client.clone(), repository.clone(), 5);

        let turn = runtime.run(vec![Message::user("查询")]).await;

        assert_eq!(tool_payloads(&turn.transcript)[0].1["success"], json!(false));
        assert_eq!(repository.total_calls(), 0);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn write_statements_never_reach_storage() {
        let client = ScriptedClient::new(
            vec![
                tool_requests(vec![request(
                    "call_1",
                    "execute_sql_query",
                    json!({"sql": "DELETE FROM stocks"}),
                )]),
                final_text("不允许"),
            ],
            final_text("unused"),
        );
        let repository = seeded_repository().await;
        let runtime = runtime(client, repository.clone(), 5);

        let turn = runtime.run(vec![Message::user("删除所有股票")]).await;

        assert_eq!(tool_payloads(&turn.transcript)[0].1["success"], json!(false));
        assert_eq!(repository.total_calls(), 0);
    }

    #[tokio::test]
    async fn results_follow_request_order() {
        let client = ScriptedClient::new(
            vec![
                tool_requests(vec![
                    request("call_b", "get_database_stats", json!({})),
                    request("call_a", "get_stock_detail", json!({"stock_code": "600000"})),
                    request("call_c", "search_stock", json!({"keyword": "不存在"})),
                ]),
                final_text("完成"),
            ],
            final_text("unused"),
        );
        let runtime = runtime(client, seeded_repository().await, 5);

        let turn = runtime.run(vec![Message::user("统计")]).await;

        let ids: Vec<String> =
            tool_payloads(&turn.transcript).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, ["call_b", "call_a", "call_c"]);
        assert!(matches!(
            &turn.transcript[1],
            Message::Assistant { tool_calls, .. } if tool_calls.len() == 3
        ));
    }

    #[tokio::test]
    async fn stock_lookup_conversation_end_to_end() {
        let client = ScriptedClient::new(
            vec![
                tool_requests(vec![request(
                    "call_1",
                    "get_stock_detail",
                    json!({"stock_code": "600000"}),
                )]),
                final_text("浦发银行 PE 5.2"),
            ],
            final_text("unused"),
        );
        let repository = seeded_repository().await;
        let runtime = runtime(client.clone(), repository.clone(), 5);
        let messages: Vec<ChatMessage> =
            serde_json::from_value(json!([{"role": "user", "content": "查询 600000"}]))
                .expect("chat messages");

        let reply = runtime.chat(messages).await;

        assert_eq!(
            serde_json::to_value(&reply).expect("serialize reply"),
            json!({"content": "浦发银行 PE 5.2", "tool_calls": null})
        );
        assert_eq!(repository.lookups_for("600000"), 1);
        assert_eq!(repository.total_calls(), 1);

        let seen = client.seen.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(seen.len(), 2);
        let observed = tool_payloads(&seen[1]);
        assert_eq!(observed[0].1["data"]["name"], json!("浦发银行"));
    }

    mod properties {
        use proptest::prelude::*;
        use serde_json::json;

        use super::{request, runtime, tool_requests, RecordingRepository, ScriptedClient};
        use crate::conversation::Message;
        use crate::runtime::ITERATION_LIMIT_MESSAGE;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn looping_models_always_stop_at_the_cap(
                max_iterations in 1usize..=20,
                per_round in 1usize..=4,
            ) {
                let requests = (0..per_round)
                    .map(|index| request(&format!("call_{index}"), "get_database_stats", json!({})))
                    .collect();
                let client = ScriptedClient::new(Vec::new(), tool_requests(requests));
                let repository = std::sync::Arc::new(RecordingRepository::default());
                let agent = runtime(client.clone(), repository, max_iterations);

                let executor = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("test runtime");
                let turn = executor.block_on(agent.run(vec![Message::user("一直查")]));

                prop_assert_eq!(client.calls(), max_iterations);
                prop_assert_eq!(turn.rounds, max_iterations);
                prop_assert_eq!(turn.dispatched, max_iterations * per_round);
                prop_assert_eq!(turn.content.as_deref(), Some(ITERATION_LIMIT_MESSAGE));
            }
        }
    }
}

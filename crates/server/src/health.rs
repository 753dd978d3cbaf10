use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use stockpilot_agent::AgentRuntime;
use stockpilot_db::DbPool;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    runtime: Arc<AgentRuntime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub agent: HealthCheck,
    pub database: HealthCheck,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, runtime: Arc<AgentRuntime>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, runtime })
}

/// Reports `ready` only when the stock tables answer a query.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        agent: HealthCheck {
            status: "ready",
            detail: format!(
                "provider {} with {} tools",
                state.runtime.provider(),
                state.runtime.tools().len()
            ),
        },
        database,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stocks").fetch_one(pool).await {
        Ok(count) => HealthCheck { status: "ready", detail: format!("{count} stocks available") },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{extract::State, http::StatusCode, Json};
    use serde_json::Value;
    use stockpilot_agent::{
        AgentRuntime, LlmClient, Message, NormalizedResponse, SqlGuardPolicy, ToolRegistry,
    };
    use stockpilot_db::{
        connect_with_settings, migrations, DbPool, DemoDataset, InMemoryStockRepository,
    };

    use crate::health::{health, HealthState};

    struct Silent;

    #[async_trait]
    impl LlmClient for Silent {
        fn provider(&self) -> &'static str {
            "silent"
        }

        fn describe_tools(&self) -> Vec<Value> {
            Vec::new()
        }

        async fn send(&self, _transcript: &[Message]) -> NormalizedResponse {
            NormalizedResponse::FinalText(None)
        }
    }

    fn state(db_pool: DbPool) -> HealthState {
        let tools = ToolRegistry::stock_tools(
            Arc::new(InMemoryStockRepository::default()),
            SqlGuardPolicy::default(),
        );
        let runtime = Arc::new(AgentRuntime::new(Arc::new(Silent), Arc::new(tools), 3));
        HealthState { db_pool, runtime }
    }

    #[tokio::test]
    async fn health_counts_seeded_stocks() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        migrations::run_pending(&pool).await.expect("migrate");
        DemoDataset::load(&pool).await.expect("seed");

        let (status, Json(payload)) = health(State(state(pool.clone()))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.detail, "4 stocks available");
        assert_eq!(payload.agent.detail, "provider silent with 6 tools");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_is_degraded_before_migrations() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");

        let (status, Json(payload)) = health(State(state(pool.clone()))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.agent.status, "ready");

        pool.close().await;
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use stockpilot_db::StockRepository;

use super::catalog::EXECUTE_SQL_QUERY;
use super::{optional_integer, required_string, Tool, ToolError};
use crate::guardrails::{SqlGuardDecision, SqlGuardPolicy};

/// Free-form read-only SQL. Statements are vetted by [`SqlGuardPolicy`] before
/// storage is touched; execution errors echo the rewritten query.
pub struct ExecuteSqlQuery {
    repository: Arc<dyn StockRepository>,
    policy: SqlGuardPolicy,
}

impl ExecuteSqlQuery {
    pub fn new(repository: Arc<dyn StockRepository>, policy: SqlGuardPolicy) -> Self {
        Self { repository, policy }
    }
}

#[async_trait]
impl Tool for ExecuteSqlQuery {
    fn name(&self) -> &'static str {
        EXECUTE_SQL_QUERY
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let statement = required_string(arguments, "sql")?;
        let requested_limit = optional_integer(arguments, "limit")?;

        let (query, limit) = match self.policy.evaluate(&statement, requested_limit) {
            SqlGuardDecision::Allow { query, limit } => (query, limit),
            SqlGuardDecision::Deny { reason_code, user_message } => {
                warn!(
                    event_name = "agent.sql.denied",
                    reason_code,
                    statement = %statement,
                    "sql statement rejected by guard"
                );
                return Ok(json!({
                    "success": false,
                    "message": user_message,
                    "reason_code": reason_code,
                }));
            }
        };

        match self.repository.execute_read_only(&query).await {
            Ok(mut rows) => {
                rows.truncate(limit as usize);
                Ok(json!({
                    "success": true,
                    "data": rows,
                    "count": rows.len(),
                    "query": query,
                }))
            }
            Err(error) => {
                warn!(
                    event_name = "agent.sql.failed",
                    query = %query,
                    error = %error,
                    "read-only query failed"
                );
                Ok(json!({
                    "success": false,
                    "message": format!("SQL 执行失败: {error}"),
                    "query": query,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::{json, Map, Value};

    use stockpilot_core::domain::stock::{
        IndustryCount, Stock, StockCode, StockCriteria, StockDaily, StockListQuery, StockPage,
    };
    use stockpilot_db::{QueryRow, RepositoryError, StockRepository};

    use super::ExecuteSqlQuery;
    use crate::guardrails::SqlGuardPolicy;
    use crate::tools::Tool;

    /// Records every statement that reaches storage and returns `rows` rows.
    #[derive(Default)]
    struct RecordingSql {
        statements: Mutex<Vec<String>>,
        calls: AtomicUsize,
        rows: usize,
        fail: bool,
    }

    #[async_trait]
    impl StockRepository for RecordingSql {
        async fn find_by_code(&self, _: &StockCode) -> Result<Option<Stock>, RepositoryError> {
            Ok(None)
        }
        async fn search_by_keyword_or_name(
            &self,
            _: &str,
            _: u32,
        ) -> Result<Vec<Stock>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn history_by_code_and_date_range(
            &self,
            _: &StockCode,
            _: NaiveDate,
            _: NaiveDate,
            _: u32,
        ) -> Result<Vec<StockDaily>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn filter_by_criteria(
            &self,
            _: &StockCriteria,
            _: u32,
        ) -> Result<Vec<Stock>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn list_stocks(&self, _: &StockListQuery) -> Result<StockPage, RepositoryError> {
            Ok(StockPage::default())
        }
        async fn industry_counts(&self) -> Result<Vec<IndustryCount>, RepositoryError> {
            Ok(Vec::new())
        }
        async fn count_stocks(&self) -> Result<i64, RepositoryError> {
            Ok(0)
        }
        async fn count_daily_records(&self) -> Result<i64, RepositoryError> {
            Ok(0)
        }
        async fn latest_trade_date(&self) -> Result<Option<NaiveDate>, RepositoryError> {
            Ok(None)
        }
        async fn execute_read_only(&self, sql: &str) -> Result<Vec<QueryRow>, RepositoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut statements) = self.statements.lock() {
                statements.push(sql.to_string());
            }
            if self.fail {
                return Err(RepositoryError::Decode("no such column: bogus".to_string()));
            }
            Ok((0..self.rows)
                .map(|index| {
                    let mut row = QueryRow::new();
                    row.insert("n".to_string(), json!(index));
                    row
                })
                .collect())
        }
    }

    fn sql_args(sql: &str, limit: Option<i64>) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("sql".to_string(), json!(sql));
        if let Some(limit) = limit {
            map.insert("limit".to_string(), json!(limit));
        }
        map
    }

    #[tokio::test]
    async fn select_gains_limit_and_reports_rows() {
        let storage = Arc::new(RecordingSql { rows: 3, ..RecordingSql::default() });
        let tool = ExecuteSqlQuery::new(storage.clone(), SqlGuardPolicy::default());

        let payload =
            tool.execute(&sql_args("select code from stocks", None)).await.expect("payload");

        assert_eq!(payload["success"], json!(true));
        assert_eq!(payload["count"], json!(3));
        assert_eq!(payload["query"], json!("select code from stocks LIMIT 100"));
        let statements = storage.statements.lock().expect("lock").clone();
        assert_eq!(statements, vec!["select code from stocks LIMIT 100".to_string()]);
    }

    #[tokio::test]
    async fn writes_never_reach_storage() {
        let storage = Arc::new(RecordingSql::default());
        let tool = ExecuteSqlQuery::new(storage.clone(), SqlGuardPolicy::default());

        let payload = tool.execute(&sql_args("DELETE FROM stocks", None)).await.expect("payload");

        assert_eq!(payload["success"], json!(false));
        assert_eq!(payload["reason_code"], json!("not_select"));
        assert_eq!(storage.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn executed_cap_never_exceeds_the_ceiling() {
        let storage = Arc::new(RecordingSql { rows: 700, ..RecordingSql::default() });
        let tool = ExecuteSqlQuery::new(storage.clone(), SqlGuardPolicy::default());

        let payload = tool
            .execute(&sql_args("SELECT * FROM stocks LIMIT 1000", Some(5_000)))
            .await
            .expect("payload");

        assert_eq!(payload["query"], json!("SELECT * FROM stocks LIMIT 500"));
        assert_eq!(payload["count"], json!(500));
    }

    #[tokio::test]
    async fn execution_errors_echo_the_rewritten_query() {
        let storage = Arc::new(RecordingSql { fail: true, ..RecordingSql::default() });
        let tool = ExecuteSqlQuery::new(storage, SqlGuardPolicy::default());

        let payload = tool.execute(&sql_args("SELECT bogus FROM stocks", Some(7))).await.expect("payload");

        assert_eq!(payload["success"], json!(false));
        assert_eq!(payload["query"], json!("SELECT bogus FROM stocks LIMIT 7"));
        assert!(payload["message"].as_str().is_some_and(|message| message.contains("bogus")));
    }
}

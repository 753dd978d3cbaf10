use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;

use stockpilot_core::domain::stock::{
    IndustryCount, Stock, StockCode, StockCriteria, StockDaily, StockListQuery, StockPage,
};

pub mod memory;
pub mod stock;

pub use memory::InMemoryStockRepository;
pub use stock::SqlStockRepository;

/// One result row of a free-form query, keyed by column name in select order.
pub type QueryRow = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Read path over the stock tables. Nothing here mutates data.
#[async_trait]
pub trait StockRepository: Send + Sync {
    async fn find_by_code(&self, code: &StockCode) -> Result<Option<Stock>, RepositoryError>;

    async fn search_by_keyword_or_name(
        &self,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<Stock>, RepositoryError>;

    /// Daily bars with `start <= trade_date <= end`, newest first.
    async fn history_by_code_and_date_range(
        &self,
        code: &StockCode,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<StockDaily>, RepositoryError>;

    async fn filter_by_criteria(
        &self,
        criteria: &StockCriteria,
        limit: u32,
    ) -> Result<Vec<Stock>, RepositoryError>;

    /// One page of the listing plus the total number of matching rows.
    async fn list_stocks(&self, query: &StockListQuery) -> Result<StockPage, RepositoryError>;

    /// Stocks per non-empty industry, largest first.
    async fn industry_counts(&self) -> Result<Vec<IndustryCount>, RepositoryError>;

    async fn count_stocks(&self) -> Result<i64, RepositoryError>;

    async fn count_daily_records(&self) -> Result<i64, RepositoryError>;

    async fn latest_trade_date(&self) -> Result<Option<NaiveDate>, RepositoryError>;

    /// Runs an already-vetted statement on a connection that refuses writes.
    async fn execute_read_only(&self, sql: &str) -> Result<Vec<QueryRow>, RepositoryError>;
}

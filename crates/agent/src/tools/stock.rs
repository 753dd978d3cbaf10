use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Local};
use serde_json::{json, Map, Value};
use tracing::debug;

use stockpilot_core::domain::stock::{Stock, StockCriteria, DATETIME_FORMAT, DATE_FORMAT};
use stockpilot_db::StockRepository;

use super::catalog::{
    FILTER_STOCKS, GET_DATABASE_STATS, GET_STOCK_DETAIL, GET_STOCK_HISTORY, SEARCH_STOCK,
};
use super::{
    bounded_limit, failure_message, optional_integer, optional_number, optional_string,
    required_string, stock_code_arg, Tool, ToolError,
};

const MAX_LISTING_ROWS: u32 = 500;
const MAX_HISTORY_DAYS: u32 = 3650;

pub struct SearchStock {
    repository: Arc<dyn StockRepository>,
}

impl SearchStock {
    pub fn new(repository: Arc<dyn StockRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Tool for SearchStock {
    fn name(&self) -> &'static str {
        SEARCH_STOCK
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let keyword = required_string(arguments, "keyword")?;
        let limit = bounded_limit(optional_integer(arguments, "limit")?, 10, MAX_LISTING_ROWS);

        let stocks = self.repository.search_by_keyword_or_name(keyword.trim(), limit).await?;
        if stocks.is_empty() {
            return Ok(failure_message(format!("未找到包含 '{keyword}' 的股票")));
        }

        let data: Vec<Value> = stocks
            .iter()
            .map(|stock| {
                json!({
                    "code": stock.code,
                    "name": stock.name,
                    "market": stock.market,
                    "industry": stock.industry,
                    "pe_ratio": stock.pe_ratio,
                    "pb_ratio": stock.pb_ratio,
                    "market_cap": stock.total_market_cap,
                    "turnover_rate": stock.turnover_rate,
                })
            })
            .collect();

        Ok(json!({ "success": true, "count": data.len(), "data": data }))
    }
}

pub struct GetStockDetail {
    repository: Arc<dyn StockRepository>,
}

impl GetStockDetail {
    pub fn new(repository: Arc<dyn StockRepository>) -> Self {
        Self { repository }
    }
}

fn detail_payload(stock: &Stock) -> Value {
    json!({
        "code": stock.code,
        "name": stock.name,
        "market": stock.market,
        "industry": stock.industry,
        "list_date": stock.list_date.map(|date| date.format(DATE_FORMAT).to_string()),
        "pe_ratio": stock.pe_ratio,
        "pb_ratio": stock.pb_ratio,
        "roe": stock.roe,
        "total_market_cap": stock.total_market_cap,
        "circulating_market_cap": stock.circulating_market_cap,
        "turnover_rate": stock.turnover_rate,
        "total_assets": stock.total_assets,
        "net_assets": stock.net_assets,
        "updated_at": stock.updated_at.map(|at| at.format(DATETIME_FORMAT).to_string()),
    })
}

#[async_trait]
impl Tool for GetStockDetail {
    fn name(&self) -> &'static str {
        GET_STOCK_DETAIL
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let code = stock_code_arg(arguments, "stock_code")?;

        match self.repository.find_by_code(&code).await? {
            Some(stock) => Ok(json!({ "success": true, "data": detail_payload(&stock) })),
            None => Ok(failure_message(format!("未找到股票代码 {code}"))),
        }
    }
}

/// Daily bars of the last `days` calendar days, newest first, at most `days`
/// rows.
pub struct GetStockHistory {
    repository: Arc<dyn StockRepository>,
}

impl GetStockHistory {
    pub fn new(repository: Arc<dyn StockRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Tool for GetStockHistory {
    fn name(&self) -> &'static str {
        GET_STOCK_HISTORY
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let code = stock_code_arg(arguments, "stock_code")?;
        let days = bounded_limit(optional_integer(arguments, "days")?, 30, MAX_HISTORY_DAYS);

        let end = Local::now().date_naive();
        let start = end - Duration::days(i64::from(days));
        let history =
            self.repository.history_by_code_and_date_range(&code, start, end, days).await?;

        if history.is_empty() {
            return Ok(failure_message(format!("未找到股票 {code} 的历史数据")));
        }

        let data: Vec<Value> = history
            .iter()
            .map(|bar| {
                json!({
                    "date": bar.trade_date.format(DATE_FORMAT).to_string(),
                    "open": bar.open,
                    "close": bar.close,
                    "high": bar.high,
                    "low": bar.low,
                    "volume": bar.volume,
                    "amount": bar.amount,
                    "change": bar.change,
                    "pct_change": bar.pct_change,
                    "turnover_rate": bar.turnover_rate,
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "data": data,
            "count": history.len(),
            "stock_code": code,
        }))
    }
}

pub struct FilterStocks {
    repository: Arc<dyn StockRepository>,
}

impl FilterStocks {
    pub fn new(repository: Arc<dyn StockRepository>) -> Self {
        Self { repository }
    }
}

fn criteria_from(arguments: &Map<String, Value>) -> Result<StockCriteria, ToolError> {
    Ok(StockCriteria {
        min_pe: optional_number(arguments, "min_pe")?,
        max_pe: optional_number(arguments, "max_pe")?,
        min_pb: optional_number(arguments, "min_pb")?,
        max_pb: optional_number(arguments, "max_pb")?,
        min_market_cap: optional_number(arguments, "min_market_cap")?,
        max_market_cap: optional_number(arguments, "max_market_cap")?,
        industry: optional_string(arguments, "industry")?,
    })
}

#[async_trait]
impl Tool for FilterStocks {
    fn name(&self) -> &'static str {
        FILTER_STOCKS
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let criteria = criteria_from(arguments)?;
        let limit = bounded_limit(optional_integer(arguments, "limit")?, 20, MAX_LISTING_ROWS);

        if criteria.is_unbounded() {
            debug!(
                event_name = "agent.tool.filter_unbounded",
                limit,
                "filter_stocks called without any bound; listing by code"
            );
        }
        let stocks = self.repository.filter_by_criteria(&criteria, limit).await?;
        if stocks.is_empty() {
            return Ok(failure_message("未找到符合条件的股票"));
        }

        let data: Vec<Value> = stocks
            .iter()
            .map(|stock| {
                json!({
                    "code": stock.code,
                    "name": stock.name,
                    "industry": stock.industry,
                    "pe_ratio": stock.pe_ratio,
                    "pb_ratio": stock.pb_ratio,
                    "roe": stock.roe,
                    "market_cap": stock.total_market_cap,
                    "turnover_rate": stock.turnover_rate,
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "data": data,
            "count": stocks.len(),
            "filters": criteria,
        }))
    }
}

pub struct GetDatabaseStats {
    repository: Arc<dyn StockRepository>,
}

impl GetDatabaseStats {
    pub fn new(repository: Arc<dyn StockRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl Tool for GetDatabaseStats {
    fn name(&self) -> &'static str {
        GET_DATABASE_STATS
    }

    async fn execute(&self, _arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let total_stocks = self.repository.count_stocks().await?;
        let total_daily_records = self.repository.count_daily_records().await?;
        let latest_trade_date = self.repository.latest_trade_date().await?;

        Ok(json!({
            "success": true,
            "data": {
                "total_stocks": total_stocks,
                "total_daily_records": total_daily_records,
                "latest_trade_date": latest_trade_date.map(|date| date.format(DATE_FORMAT).to_string()),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Local, NaiveDate};
    use serde_json::{json, Map, Value};

    use stockpilot_core::domain::stock::{Stock, StockCode, StockDaily};
    use stockpilot_db::InMemoryStockRepository;

    use super::{FilterStocks, GetDatabaseStats, GetStockDetail, GetStockHistory, SearchStock};
    use crate::tools::Tool;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn repository() -> Arc<InMemoryStockRepository> {
        let repository = Arc::new(InMemoryStockRepository::default());
        repository
            .insert_stock(Stock {
                code: StockCode("600000".to_string()),
                name: "浦发银行".to_string(),
                market: Some("上海主板".to_string()),
                industry: Some("银行".to_string()),
                list_date: NaiveDate::from_ymd_opt(1999, 11, 10),
                pe_ratio: Some(5.2),
                pb_ratio: Some(0.41),
                total_market_cap: Some(2150.3),
                updated_at: NaiveDate::from_ymd_opt(2024, 6, 7)
                    .and_then(|date| date.and_hms_opt(16, 30, 0)),
                ..Stock::default()
            })
            .await;
        repository
            .insert_stock(Stock {
                code: StockCode("000001".to_string()),
                name: "平安银行".to_string(),
                industry: Some("银行".to_string()),
                pe_ratio: Some(4.6),
                ..Stock::default()
            })
            .await;

        let today = Local::now().date_naive();
        for offset in 0..5 {
            repository
                .insert_daily(StockDaily {
                    code: StockCode("600000".to_string()),
                    trade_date: today - Duration::days(offset),
                    close: Some(7.3 - offset as f64 * 0.01),
                    volume: Some(400_000),
                    ..StockDaily::default()
                })
                .await;
        }
        repository
    }

    #[tokio::test]
    async fn search_returns_listing_rows_or_a_not_found_message() {
        let tool = SearchStock::new(repository().await);

        let found = tool.execute(&args(json!({"keyword": "银行"}))).await.expect("search");
        assert_eq!(found["success"], json!(true));
        assert_eq!(found["count"], json!(2));
        assert_eq!(found["data"][0]["code"], json!("000001"));
        assert!(found["data"][0].get("market_cap").is_some());

        let missing = tool.execute(&args(json!({"keyword": "券商"}))).await.expect("search");
        assert_eq!(missing, json!({"success": false, "message": "未找到包含 '券商' 的股票"}));
    }

    #[tokio::test]
    async fn detail_formats_dates() {
        let tool = GetStockDetail::new(repository().await);

        let detail =
            tool.execute(&args(json!({"stock_code": "600000"}))).await.expect("detail");
        assert_eq!(detail["data"]["name"], json!("浦发银行"));
        assert_eq!(detail["data"]["list_date"], json!("1999-11-10"));
        assert_eq!(detail["data"]["updated_at"], json!("2024-06-07 16:30:00"));

        let missing = tool.execute(&args(json!({"stock_code": 999999}))).await.expect("detail");
        assert_eq!(missing["message"], json!("未找到股票代码 999999"));
    }

    #[tokio::test]
    async fn history_is_bounded_by_days_and_newest_first() {
        let tool = GetStockHistory::new(repository().await);

        let history = tool
            .execute(&args(json!({"stock_code": "600000", "days": 2})))
            .await
            .expect("history");
        assert_eq!(history["success"], json!(true));
        assert_eq!(history["count"], json!(2));
        assert_eq!(history["stock_code"], json!("600000"));
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(history["data"][0]["date"], json!(today));

        let missing = tool.execute(&args(json!({"stock_code": "000001"}))).await.expect("history");
        assert_eq!(missing["message"], json!("未找到股票 000001 的历史数据"));
    }

    #[tokio::test]
    async fn filter_echoes_the_applied_filters() {
        let tool = FilterStocks::new(repository().await);

        let filtered = tool
            .execute(&args(json!({"max_pe": "5", "industry": "银行"})))
            .await
            .expect("filter");
        assert_eq!(filtered["count"], json!(1));
        assert_eq!(filtered["data"][0]["code"], json!("000001"));
        assert_eq!(filtered["filters"]["max_pe"], json!(5.0));
        assert_eq!(filtered["filters"]["min_pe"], Value::Null);

        let empty = tool.execute(&args(json!({"min_pe": 100}))).await.expect("filter");
        assert_eq!(empty, json!({"success": false, "message": "未找到符合条件的股票"}));
    }

    #[tokio::test]
    async fn unbounded_filter_lists_by_code() {
        let tool = FilterStocks::new(repository().await);

        let listed = tool.execute(&args(json!({"limit": 1}))).await.expect("filter");
        assert_eq!(listed["count"], json!(1));
        assert_eq!(listed["data"][0]["code"], json!("000001"));
        assert_eq!(listed["filters"]["industry"], Value::Null);
    }

    #[tokio::test]
    async fn stats_summarise_both_tables() {
        let tool = GetDatabaseStats::new(repository().await);

        let stats = tool.execute(&Map::new()).await.expect("stats");
        assert_eq!(stats["data"]["total_stocks"], json!(2));
        assert_eq!(stats["data"]["total_daily_records"], json!(5));
        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(stats["data"]["latest_trade_date"], json!(today));
    }
}

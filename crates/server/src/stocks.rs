use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration, Local};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use stockpilot_core::domain::stock::{
    SortOrder, Stock, StockCode, StockCriteria, StockDaily, StockListQuery, StockSortField,
    DATETIME_FORMAT, DATE_FORMAT,
};
use stockpilot_db::{RepositoryError, StockRepository};

const DEFAULT_SEARCH_LIMIT: u32 = 20;
const DEFAULT_HISTORY_DAYS: u32 = 30;
const DEFAULT_KLINE_DAYS: u32 = 90;

#[derive(Clone)]
pub struct StocksState {
    repository: Arc<dyn StockRepository>,
}

#[derive(Debug, thiserror::Error)]
pub enum StocksApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Repository(#[from] RepositoryError),
}

impl IntoResponse for StocksApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Repository(repository_error) => {
                error!(
                    event_name = "server.stocks.repository_failed",
                    error = %repository_error,
                    "stock browsing query failed"
                );
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "success": false, "message": self.to_string() }))).into_response()
    }
}

pub fn router(repository: Arc<dyn StockRepository>) -> Router {
    Router::new()
        .route("/api/stats", get(stats))
        .route("/api/stocks/search", get(search))
        .route("/api/stocks/list", post(list))
        .route("/api/stocks/{code}", get(detail))
        .route("/api/stocks/{code}/history", get(history))
        .route("/api/stocks/{code}/kline", get(kline))
        .route("/api/industries", get(industries))
        .with_state(StocksState { repository })
}

pub async fn stats(State(state): State<StocksState>) -> Result<Json<Value>, StocksApiError> {
    let total_stocks = state.repository.count_stocks().await?;
    let total_daily_records = state.repository.count_daily_records().await?;
    let latest = state.repository.latest_trade_date().await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "total_stocks": total_stocks,
            "total_daily_records": total_daily_records,
            "latest_trade_date": latest.map(|date| date.format(DATE_FORMAT).to_string()),
            "updated_at": Local::now().format(DATETIME_FORMAT).to_string(),
        }
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub keyword: String,
    pub limit: Option<u32>,
}

pub async fn search(
    State(state): State<StocksState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Value>, StocksApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let stocks = state.repository.search_by_keyword_or_name(&params.keyword, limit).await?;

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
    Ok(Json(json!({ "success": true, "count": data.len(), "data": data })))
}

pub async fn detail(
    State(state): State<StocksState>,
    Path(code): Path<String>,
) -> Result<Json<Value>, StocksApiError> {
    let stock = state
        .repository
        .find_by_code(&StockCode(code.clone()))
        .await?
        .ok_or_else(|| StocksApiError::NotFound(format!("未找到股票 {code}")))?;

    Ok(Json(json!({ "success": true, "data": detail_json(&stock) })))
}

fn detail_json(stock: &Stock) -> Value {
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

#[derive(Debug, Default, Deserialize)]
pub struct DaysParams {
    pub days: Option<u32>,
}

/// Bars from the last `days` calendar days, newest first.
async fn recent_bars(
    repository: &dyn StockRepository,
    code: &str,
    days: u32,
    limit: u32,
) -> Result<Vec<StockDaily>, RepositoryError> {
    let end = Local::now().date_naive();
    let start = end - Duration::days(i64::from(days));
    repository
        .history_by_code_and_date_range(&StockCode(code.to_string()), start, end, limit)
        .await
}

pub async fn history(
    State(state): State<StocksState>,
    Path(code): Path<String>,
    Query(params): Query<DaysParams>,
) -> Result<Json<Value>, StocksApiError> {
    let days = params.days.unwrap_or(DEFAULT_HISTORY_DAYS);
    let bars = recent_bars(state.repository.as_ref(), &code, days, days).await?;
    if bars.is_empty() {
        return Err(StocksApiError::NotFound(format!("未找到股票 {code} 的历史数据")));
    }

    let data: Vec<Value> = bars
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
    Ok(Json(json!({ "success": true, "count": data.len(), "data": data })))
}

/// Candlestick series in ascending date order; each candle is
/// `[open, close, low, high]` with missing prices as 0.
pub async fn kline(
    State(state): State<StocksState>,
    Path(code): Path<String>,
    Query(params): Query<DaysParams>,
) -> Result<Json<Value>, StocksApiError> {
    let days = params.days.unwrap_or(DEFAULT_KLINE_DAYS);
    let mut bars =
        recent_bars(state.repository.as_ref(), &code, days, days.saturating_mul(2)).await?;
    if bars.is_empty() {
        return Err(StocksApiError::NotFound(format!("未找到股票 {code} 的K线数据")));
    }
    bars.sort_by_key(|bar| bar.trade_date);

    let dates: Vec<String> =
        bars.iter().map(|bar| bar.trade_date.format(DATE_FORMAT).to_string()).collect();
    let candles: Vec<[f64; 4]> = bars
        .iter()
        .map(|bar| {
            [
                bar.open.unwrap_or(0.0),
                bar.close.unwrap_or(0.0),
                bar.low.unwrap_or(0.0),
                bar.high.unwrap_or(0.0),
            ]
        })
        .collect();
    let volume: Vec<i64> = bars.iter().map(|bar| bar.volume.unwrap_or(0)).collect();

    Ok(Json(json!({
        "success": true,
        "data": { "dates": dates, "kline": candles, "volume": volume }
    })))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StockListRequest {
    pub page: u32,
    pub page_size: u32,
    pub keyword: Option<String>,
    pub industry: Option<String>,
    pub min_pe: Option<f64>,
    pub max_pe: Option<f64>,
    pub min_pb: Option<f64>,
    pub max_pb: Option<f64>,
    pub min_market_cap: Option<f64>,
    pub max_market_cap: Option<f64>,
    pub min_turnover: Option<f64>,
    pub max_turnover: Option<f64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl Default for StockListRequest {
    fn default() -> Self {
        let defaults = StockListQuery::default();
        Self {
            page: defaults.page,
            page_size: defaults.page_size,
            keyword: None,
            industry: None,
            min_pe: None,
            max_pe: None,
            min_pb: None,
            max_pb: None,
            min_market_cap: None,
            max_market_cap: None,
            min_turnover: None,
            max_turnover: None,
            sort_by: None,
            sort_order: None,
        }
    }
}

impl StockListRequest {
    fn into_query(self) -> StockListQuery {
        StockListQuery {
            keyword: self.keyword,
            criteria: StockCriteria {
                min_pe: self.min_pe,
                max_pe: self.max_pe,
                min_pb: self.min_pb,
                max_pb: self.max_pb,
                min_market_cap: self.min_market_cap,
                max_market_cap: self.max_market_cap,
                industry: self.industry,
            },
            min_turnover: self.min_turnover,
            max_turnover: self.max_turnover,
            sort_by: self.sort_by.as_deref().map(StockSortField::parse).unwrap_or_default(),
            sort_order: self.sort_order.as_deref().map(SortOrder::parse).unwrap_or_default(),
            page: self.page.max(1),
            page_size: self.page_size.max(1),
        }
    }
}

pub async fn list(
    State(state): State<StocksState>,
    Json(request): Json<StockListRequest>,
) -> Result<Json<Value>, StocksApiError> {
    let query = request.into_query();
    let page = state.repository.list_stocks(&query).await?;
    info!(
        event_name = "server.stocks.listed",
        page = query.page,
        page_size = query.page_size,
        total = page.total,
        "stock listing served"
    );

    let data: Vec<Value> = page
        .stocks
        .iter()
        .map(|stock| {
            json!({
                "code": stock.code,
                "name": stock.name,
                "market": stock.market,
                "industry": stock.industry,
                "pe_ratio": stock.pe_ratio,
                "pb_ratio": stock.pb_ratio,
                "roe": stock.roe,
                "total_market_cap": stock.total_market_cap,
                "circulating_market_cap": stock.circulating_market_cap,
                "turnover_rate": stock.turnover_rate,
                "updated_at": stock.updated_at.map(|at| at.format(DATETIME_FORMAT).to_string()),
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "data": data,
        "pagination": {
            "page": query.page,
            "page_size": query.page_size,
            "total": page.total,
            "total_pages": query.total_pages(page.total),
        }
    })))
}

pub async fn industries(State(state): State<StocksState>) -> Result<Json<Value>, StocksApiError> {
    let counts = state.repository.industry_counts().await?;
    Ok(Json(json!({ "success": true, "data": counts })))
}

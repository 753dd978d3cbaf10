use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use stockpilot_core::domain::stock::{
    IndustryCount, SortOrder, Stock, StockCode, StockCriteria, StockDaily, StockListQuery,
    StockPage, StockSortField,
};

use super::{QueryRow, RepositoryError, StockRepository};

/// Map-backed repository for tests and offline demos. Free-form SQL is not
/// supported.
#[derive(Default)]
pub struct InMemoryStockRepository {
    stocks: RwLock<BTreeMap<String, Stock>>,
    daily: RwLock<BTreeMap<(String, NaiveDate), StockDaily>>,
}

impl InMemoryStockRepository {
    pub async fn insert_stock(&self, stock: Stock) {
        let mut stocks = self.stocks.write().await;
        stocks.insert(stock.code.0.clone(), stock);
    }

    pub async fn insert_daily(&self, bar: StockDaily) {
        let mut daily = self.daily.write().await;
        daily.insert((bar.code.0.clone(), bar.trade_date), bar);
    }
}

fn within(value: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    min.map_or(true, |min| value >= min) && max.map_or(true, |max| value <= max)
}

fn matches_criteria(stock: &Stock, criteria: &StockCriteria) -> bool {
    let industry_ok = match criteria.industry.as_deref().filter(|value| !value.is_empty()) {
        Some(wanted) => stock.industry.as_deref().is_some_and(|industry| industry.contains(wanted)),
        None => true,
    };

    industry_ok
        && within(stock.pe_ratio, criteria.min_pe, criteria.max_pe)
        && within(stock.pb_ratio, criteria.min_pb, criteria.max_pb)
        && within(stock.total_market_cap, criteria.min_market_cap, criteria.max_market_cap)
}

fn matches_listing(stock: &Stock, query: &StockListQuery) -> bool {
    let keyword_ok = match query.keyword.as_deref().map(str::trim).filter(|value| !value.is_empty())
    {
        Some(keyword) => stock.code.0.contains(keyword) || stock.name.contains(keyword),
        None => true,
    };

    keyword_ok
        && matches_criteria(stock, &query.criteria)
        && within(stock.turnover_rate, query.min_turnover, query.max_turnover)
}

fn sort_value(stock: &Stock, field: StockSortField) -> Option<f64> {
    match field {
        StockSortField::Code => None,
        StockSortField::PeRatio => stock.pe_ratio,
        StockSortField::PbRatio => stock.pb_ratio,
        StockSortField::MarketCap => stock.total_market_cap,
        StockSortField::TurnoverRate => stock.turnover_rate,
    }
}

/// SQLite ordering: NULL sorts below every number, ties break on code.
fn compare_listing(left: &Stock, right: &Stock, query: &StockListQuery) -> Ordering {
    let primary = match query.sort_by {
        StockSortField::Code => left.code.0.cmp(&right.code.0),
        field => {
            let (a, b) = (sort_value(left, field), sort_value(right, field));
            match (a, b) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
            }
        }
    };
    let primary = match query.sort_order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary.then_with(|| left.code.0.cmp(&right.code.0))
}

#[async_trait::async_trait]
impl StockRepository for InMemoryStockRepository {
    async fn find_by_code(&self, code: &StockCode) -> Result<Option<Stock>, RepositoryError> {
        let stocks = self.stocks.read().await;
        Ok(stocks.get(code.as_str()).cloned())
    }

    async fn search_by_keyword_or_name(
        &self,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<Stock>, RepositoryError> {
        let keyword = keyword.trim();
        let stocks = self.stocks.read().await;
        Ok(stocks
            .values()
            .filter(|stock| stock.code.0.contains(keyword) || stock.name.contains(keyword))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn history_by_code_and_date_range(
        &self,
        code: &StockCode,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<StockDaily>, RepositoryError> {
        let daily = self.daily.read().await;
        Ok(daily
            .range((code.0.clone(), start)..=(code.0.clone(), end))
            .rev()
            .take(limit as usize)
            .map(|(_, bar)| bar.clone())
            .collect())
    }

    async fn filter_by_criteria(
        &self,
        criteria: &StockCriteria,
        limit: u32,
    ) -> Result<Vec<Stock>, RepositoryError> {
        let stocks = self.stocks.read().await;
        Ok(stocks
            .values()
            .filter(|stock| matches_criteria(stock, criteria))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_stocks(&self, query: &StockListQuery) -> Result<StockPage, RepositoryError> {
        let stocks = self.stocks.read().await;
        let mut matched: Vec<&Stock> =
            stocks.values().filter(|stock| matches_listing(stock, query)).collect();
        matched.sort_by(|left, right| compare_listing(left, right, query));

        let total = matched.len() as i64;
        let offset = usize::try_from(query.offset()).unwrap_or(usize::MAX);
        let stocks = matched
            .into_iter()
            .skip(offset)
            .take(query.page_size as usize)
            .cloned()
            .collect();
        Ok(StockPage { stocks, total })
    }

    async fn industry_counts(&self) -> Result<Vec<IndustryCount>, RepositoryError> {
        let stocks = self.stocks.read().await;
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for industry in stocks.values().filter_map(|stock| stock.industry.as_deref()) {
            if !industry.is_empty() {
                *counts.entry(industry).or_default() += 1;
            }
        }

        let mut counts: Vec<IndustryCount> = counts
            .into_iter()
            .map(|(industry, count)| IndustryCount { industry: industry.to_string(), count })
            .collect();
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.industry.cmp(&b.industry)));
        Ok(counts)
    }

    async fn count_stocks(&self) -> Result<i64, RepositoryError> {
        Ok(self.stocks.read().await.len() as i64)
    }

    async fn count_daily_records(&self) -> Result<i64, RepositoryError> {
        Ok(self.daily.read().await.len() as i64)
    }

    async fn latest_trade_date(&self) -> Result<Option<NaiveDate>, RepositoryError> {
        let daily = self.daily.read().await;
        Ok(daily.keys().map(|(_, date)| *date).max())
    }

    async fn execute_read_only(&self, _sql: &str) -> Result<Vec<QueryRow>, RepositoryError> {
        Err(RepositoryError::Unsupported(
            "free-form SQL requires a SQLite-backed repository".to_string(),
        ))
    }
}

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Column, QueryBuilder, Row, TypeInfo, ValueRef};

use stockpilot_core::domain::stock::{
    IndustryCount, Stock, StockCode, StockCriteria, StockDaily, StockListQuery, StockPage,
    DATETIME_FORMAT, DATE_FORMAT,
};

use super::{QueryRow, RepositoryError, StockRepository};
use crate::DbPool;

const STOCK_COLUMNS: &str = "SELECT code, name, market, industry, list_date, total_assets,
        net_assets, pe_ratio, pb_ratio, roe, total_market_cap, circulating_market_cap,
        turnover_rate, updated_at
 FROM stocks";

const DAILY_COLUMNS: &str = "SELECT code, trade_date, open, close, high, low, volume, amount,
        change, pct_change, total_market_cap, circulating_market_cap, turnover_rate
 FROM stock_daily";

pub struct SqlStockRepository {
    pool: DbPool,
}

impl SqlStockRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_stock(&self, stock: &Stock) -> Result<(), RepositoryError> {
        let updated_at = stock
            .updated_at
            .unwrap_or_else(|| Local::now().naive_local())
            .format(DATETIME_FORMAT)
            .to_string();

        sqlx::query(
            "INSERT INTO stocks (code, name, market, industry, list_date, total_assets, net_assets,
                                 pe_ratio, pb_ratio, roe, total_market_cap, circulating_market_cap,
                                 turnover_rate, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET
                 name = excluded.name,
                 market = COALESCE(excluded.market, stocks.market),
                 industry = COALESCE(excluded.industry, stocks.industry),
                 list_date = COALESCE(excluded.list_date, stocks.list_date),
                 total_assets = COALESCE(excluded.total_assets, stocks.total_assets),
                 net_assets = COALESCE(excluded.net_assets, stocks.net_assets),
                 pe_ratio = COALESCE(excluded.pe_ratio, stocks.pe_ratio),
                 pb_ratio = COALESCE(excluded.pb_ratio, stocks.pb_ratio),
                 roe = COALESCE(excluded.roe, stocks.roe),
                 total_market_cap = COALESCE(excluded.total_market_cap, stocks.total_market_cap),
                 circulating_market_cap =
                     COALESCE(excluded.circulating_market_cap, stocks.circulating_market_cap),
                 turnover_rate = COALESCE(excluded.turnover_rate, stocks.turnover_rate),
                 updated_at = excluded.updated_at",
        )
        .bind(stock.code.as_str())
        .bind(&stock.name)
        .bind(&stock.market)
        .bind(&stock.industry)
        .bind(stock.list_date.map(|date| date.format(DATE_FORMAT).to_string()))
        .bind(stock.total_assets)
        .bind(stock.net_assets)
        .bind(stock.pe_ratio)
        .bind(stock.pb_ratio)
        .bind(stock.roe)
        .bind(stock.total_market_cap)
        .bind(stock.circulating_market_cap)
        .bind(stock.turnover_rate)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_daily(&self, daily: &StockDaily) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO stock_daily (code, trade_date, open, close, high, low, volume, amount,
                                      change, pct_change, total_market_cap,
                                      circulating_market_cap, turnover_rate, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(code, trade_date) DO UPDATE SET
                 open = excluded.open,
                 close = excluded.close,
                 high = excluded.high,
                 low = excluded.low,
                 volume = excluded.volume,
                 amount = excluded.amount,
                 change = excluded.change,
                 pct_change = excluded.pct_change,
                 total_market_cap = excluded.total_market_cap,
                 circulating_market_cap = excluded.circulating_market_cap,
                 turnover_rate = excluded.turnover_rate",
        )
        .bind(daily.code.as_str())
        .bind(daily.trade_date.format(DATE_FORMAT).to_string())
        .bind(daily.open)
        .bind(daily.close)
        .bind(daily.high)
        .bind(daily.low)
        .bind(daily.volume)
        .bind(daily.amount)
        .bind(daily.change)
        .bind(daily.pct_change)
        .bind(daily.total_market_cap)
        .bind(daily.circulating_market_cap)
        .bind(daily.turnover_rate)
        .bind(Local::now().naive_local().format(DATETIME_FORMAT).to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .ok()
        .or_else(|| parse_datetime(value).map(|datetime| datetime.date()))
}

pub(crate) fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.naive_local()))
}

fn decode_err(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn row_to_stock(row: &SqliteRow) -> Result<Stock, RepositoryError> {
    let code: String = row.try_get("code").map_err(decode_err)?;
    let list_date: Option<String> = row.try_get("list_date").map_err(decode_err)?;
    let updated_at: Option<String> = row.try_get("updated_at").map_err(decode_err)?;

    Ok(Stock {
        code: StockCode(code),
        name: row.try_get("name").map_err(decode_err)?,
        market: row.try_get("market").map_err(decode_err)?,
        industry: row.try_get("industry").map_err(decode_err)?,
        list_date: list_date.as_deref().and_then(parse_date),
        total_assets: row.try_get("total_assets").map_err(decode_err)?,
        net_assets: row.try_get("net_assets").map_err(decode_err)?,
        pe_ratio: row.try_get("pe_ratio").map_err(decode_err)?,
        pb_ratio: row.try_get("pb_ratio").map_err(decode_err)?,
        roe: row.try_get("roe").map_err(decode_err)?,
        total_market_cap: row.try_get("total_market_cap").map_err(decode_err)?,
        circulating_market_cap: row.try_get("circulating_market_cap").map_err(decode_err)?,
        turnover_rate: row.try_get("turnover_rate").map_err(decode_err)?,
        updated_at: updated_at.as_deref().and_then(parse_datetime),
    })
}

fn row_to_daily(row: &SqliteRow) -> Result<StockDaily, RepositoryError> {
    let code: String = row.try_get("code").map_err(decode_err)?;
    let trade_date_str: String = row.try_get("trade_date").map_err(decode_err)?;
    let trade_date = parse_date(&trade_date_str).ok_or_else(|| {
        RepositoryError::Decode(format!("invalid trade_date `{trade_date_str}` for {code}"))
    })?;

    Ok(StockDaily {
        code: StockCode(code),
        trade_date,
        open: row.try_get("open").map_err(decode_err)?,
        close: row.try_get("close").map_err(decode_err)?,
        high: row.try_get("high").map_err(decode_err)?,
        low: row.try_get("low").map_err(decode_err)?,
        volume: row.try_get("volume").map_err(decode_err)?,
        amount: row.try_get("amount").map_err(decode_err)?,
        change: row.try_get("change").map_err(decode_err)?,
        pct_change: row.try_get("pct_change").map_err(decode_err)?,
        total_market_cap: row.try_get("total_market_cap").map_err(decode_err)?,
        circulating_market_cap: row.try_get("circulating_market_cap").map_err(decode_err)?,
        turnover_rate: row.try_get("turnover_rate").map_err(decode_err)?,
    })
}

/// Converts an arbitrary result row into column-ordered JSON. Text stored in
/// DATE columns is rendered `%Y-%m-%d`, DATETIME/TIMESTAMP columns
/// `%Y-%m-%d %H:%M:%S`.
fn row_to_json(row: &SqliteRow) -> Result<QueryRow, RepositoryError> {
    let mut mapped = QueryRow::new();

    for column in row.columns() {
        let index = column.ordinal();
        let declared = column.type_info().name().to_ascii_uppercase();
        let raw = row.try_get_raw(index).map_err(decode_err)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_ascii_uppercase();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => {
                    Value::from(row.try_get_unchecked::<i64, _>(index).map_err(decode_err)?)
                }
                "REAL" | "NUMERIC" => {
                    let number = row.try_get_unchecked::<f64, _>(index).map_err(decode_err)?;
                    Number::from_f64(number).map(Value::Number).unwrap_or(Value::Null)
                }
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(index).map_err(decode_err)?;
                    Value::String(format!("<blob {} bytes>", bytes.len()))
                }
                _ => {
                    let text = row.try_get_unchecked::<String, _>(index).map_err(decode_err)?;
                    format_temporal(&declared, text)
                }
            }
        };

        mapped.insert(column.name().to_string(), value);
    }

    Ok(mapped)
}

fn format_temporal(declared: &str, text: String) -> Value {
    let formatted = if declared.contains("DATETIME") || declared.contains("TIMESTAMP") {
        parse_datetime(&text).map(|datetime| datetime.format(DATETIME_FORMAT).to_string())
    } else if declared == "DATE" {
        parse_date(&text).map(|date| date.format(DATE_FORMAT).to_string())
    } else {
        None
    };

    Value::String(formatted.unwrap_or(text))
}

#[async_trait::async_trait]
impl StockRepository for SqlStockRepository {
    async fn find_by_code(&self, code: &StockCode) -> Result<Option<Stock>, RepositoryError> {
        let row = sqlx::query(&format!("{STOCK_COLUMNS} WHERE code = ?"))
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_stock(r)?)),
            None => Ok(None),
        }
    }

    async fn search_by_keyword_or_name(
        &self,
        keyword: &str,
        limit: u32,
    ) -> Result<Vec<Stock>, RepositoryError> {
        let pattern = format!("%{}%", keyword.trim());
        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "{STOCK_COLUMNS} WHERE code LIKE ? OR name LIKE ? ORDER BY code LIMIT ?"
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stock).collect::<Result<Vec<_>, _>>()
    }

    async fn history_by_code_and_date_range(
        &self,
        code: &StockCode,
        start: NaiveDate,
        end: NaiveDate,
        limit: u32,
    ) -> Result<Vec<StockDaily>, RepositoryError> {
        let rows: Vec<SqliteRow> = sqlx::query(&format!(
            "{DAILY_COLUMNS}
             WHERE code = ? AND trade_date >= ? AND trade_date <= ?
             ORDER BY trade_date DESC
             LIMIT ?"
        ))
        .bind(code.as_str())
        .bind(start.format(DATE_FORMAT).to_string())
        .bind(end.format(DATE_FORMAT).to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_daily).collect::<Result<Vec<_>, _>>()
    }

    async fn filter_by_criteria(
        &self,
        criteria: &StockCriteria,
        limit: u32,
    ) -> Result<Vec<Stock>, RepositoryError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(STOCK_COLUMNS);
        builder.push(" WHERE 1 = 1");
        push_criteria(&mut builder, criteria);
        builder.push(" ORDER BY code LIMIT ").push_bind(i64::from(limit));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_stock).collect::<Result<Vec<_>, _>>()
    }

    async fn list_stocks(&self, query: &StockListQuery) -> Result<StockPage, RepositoryError> {
        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM stocks");
        push_listing_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(STOCK_COLUMNS);
        push_listing_filters(&mut builder, query);
        builder
            .push(format!(
                " ORDER BY {} {}, code ASC LIMIT ",
                query.sort_by.column(),
                query.sort_order.as_sql()
            ))
            .push_bind(i64::from(query.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;
        let stocks = rows.iter().map(row_to_stock).collect::<Result<Vec<_>, _>>()?;
        Ok(StockPage { stocks, total })
    }

    async fn industry_counts(&self) -> Result<Vec<IndustryCount>, RepositoryError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT industry, COUNT(code) AS count
             FROM stocks
             WHERE industry IS NOT NULL AND industry != ''
             GROUP BY industry
             ORDER BY count DESC, industry",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(industry, count)| IndustryCount { industry, count }).collect())
    }

    async fn count_stocks(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stocks")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn count_daily_records(&self) -> Result<i64, RepositoryError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM stock_daily")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn latest_trade_date(&self) -> Result<Option<NaiveDate>, RepositoryError> {
        let latest: Option<String> =
            sqlx::query_scalar::<_, Option<String>>("SELECT MAX(trade_date) FROM stock_daily")
                .fetch_one(&self.pool)
                .await?;

        Ok(latest.as_deref().and_then(parse_date))
    }

    async fn execute_read_only(&self, sql: &str) -> Result<Vec<QueryRow>, RepositoryError> {
        let mut session = ReadOnlySession::enter(&self.pool).await?;
        let fetched = session.fetch_all(sql).await;
        let reset = session.release().await;

        let rows = fetched?;
        reset?;
        rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()
    }
}

fn push_criteria(builder: &mut QueryBuilder<'_, Sqlite>, criteria: &StockCriteria) {
    let bounds = [
        ("pe_ratio >= ", criteria.min_pe),
        ("pe_ratio <= ", criteria.max_pe),
        ("pb_ratio >= ", criteria.min_pb),
        ("pb_ratio <= ", criteria.max_pb),
        ("total_market_cap >= ", criteria.min_market_cap),
        ("total_market_cap <= ", criteria.max_market_cap),
    ];
    for (clause, bound) in bounds {
        if let Some(value) = bound {
            builder.push(" AND ").push(clause).push_bind(value);
        }
    }
    if let Some(industry) = criteria.industry.as_deref().filter(|value| !value.is_empty()) {
        builder.push(" AND industry LIKE ").push_bind(format!("%{industry}%"));
    }
}

fn push_listing_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &StockListQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(keyword) = query.keyword.as_deref().map(str::trim).filter(|value| !value.is_empty())
    {
        let pattern = format!("%{keyword}%");
        builder
            .push(" AND (code LIKE ")
            .push_bind(pattern.clone())
            .push(" OR name LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    push_criteria(builder, &query.criteria);
    if let Some(min) = query.min_turnover {
        builder.push(" AND turnover_rate >= ").push_bind(min);
    }
    if let Some(max) = query.max_turnover {
        builder.push(" AND turnover_rate <= ").push_bind(max);
    }
}

/// A pooled connection switched to `PRAGMA query_only`. The pragma is
/// cleared before the connection goes back to the pool, including when the
/// owning future is dropped mid-query; a connection that cannot be reset is
/// closed instead.
struct ReadOnlySession {
    conn: Option<PoolConnection<Sqlite>>,
}

impl ReadOnlySession {
    async fn enter(pool: &DbPool) -> Result<Self, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;
        Ok(Self { conn: Some(conn) })
    }

    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<SqliteRow>, sqlx::Error> {
        let conn = self.conn.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        sqlx::query(sql).fetch_all(&mut **conn).await
    }

    async fn release(mut self) -> Result<(), sqlx::Error> {
        match self.conn.take() {
            Some(conn) => leave_read_only(conn).await,
            None => Ok(()),
        }
    }
}

impl Drop for ReadOnlySession {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = leave_read_only(conn).await;
                });
            }
            Err(_) => drop(conn.detach()),
        }
    }
}

async fn leave_read_only(mut conn: PoolConnection<Sqlite>) -> Result<(), sqlx::Error> {
    let reset = sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await;
    if reset.is_err() {
        drop(conn.detach());
    }
    reset.map(|_| ())
}

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockCode(pub String);

impl StockCode {
    /// Codes arriving as bare integers lose their leading zeros (`1` for
    /// `000001`); A-share codes are always six digits.
    pub fn from_number(value: u64) -> Self {
        Self(format!("{value:06}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub code: StockCode,
    pub name: String,
    pub market: Option<String>,
    pub industry: Option<String>,
    pub list_date: Option<NaiveDate>,
    pub total_assets: Option<f64>,
    pub net_assets: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub total_market_cap: Option<f64>,
    pub circulating_market_cap: Option<f64>,
    pub turnover_rate: Option<f64>,
    pub updated_at: Option<NaiveDateTime>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StockDaily {
    pub code: StockCode,
    pub trade_date: NaiveDate,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<i64>,
    pub amount: Option<f64>,
    pub change: Option<f64>,
    pub pct_change: Option<f64>,
    pub total_market_cap: Option<f64>,
    pub circulating_market_cap: Option<f64>,
    pub turnover_rate: Option<f64>,
}

/// Screening bounds; market cap is expressed in 亿元 like the stored columns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StockCriteria {
    pub min_pe: Option<f64>,
    pub max_pe: Option<f64>,
    pub min_pb: Option<f64>,
    pub max_pb: Option<f64>,
    pub min_market_cap: Option<f64>,
    pub max_market_cap: Option<f64>,
    pub industry: Option<String>,
}

impl StockCriteria {
    pub fn is_unbounded(&self) -> bool {
        self == &Self::default()
    }
}

/// Column a stock listing is ordered by. Unknown names fall back to `code`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockSortField {
    #[default]
    Code,
    PeRatio,
    PbRatio,
    MarketCap,
    TurnoverRate,
}

impl StockSortField {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "pe_ratio" => Self::PeRatio,
            "pb_ratio" => Self::PbRatio,
            "market_cap" | "total_market_cap" => Self::MarketCap,
            "turnover_rate" => Self::TurnoverRate,
            _ => Self::Code,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::PeRatio => "pe_ratio",
            Self::PbRatio => "pb_ratio",
            Self::MarketCap => "total_market_cap",
            Self::TurnoverRate => "turnover_rate",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    /// Anything other than `desc` (case-insensitive) sorts ascending.
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("desc") {
            Self::Desc
        } else {
            Self::Asc
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Paged stock listing: keyword over code/name, the screening bounds plus a
/// turnover range, ordering and a 1-based page.
#[derive(Clone, Debug, PartialEq)]
pub struct StockListQuery {
    pub keyword: Option<String>,
    pub criteria: StockCriteria,
    pub min_turnover: Option<f64>,
    pub max_turnover: Option<f64>,
    pub sort_by: StockSortField,
    pub sort_order: SortOrder,
    pub page: u32,
    pub page_size: u32,
}

impl Default for StockListQuery {
    fn default() -> Self {
        Self {
            keyword: None,
            criteria: StockCriteria::default(),
            min_turnover: None,
            max_turnover: None,
            sort_by: StockSortField::Code,
            sort_order: SortOrder::Asc,
            page: 1,
            page_size: 50,
        }
    }
}

impl StockListQuery {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.page_size)
    }

    pub fn total_pages(&self, total: i64) -> i64 {
        let page_size = i64::from(self.page_size.max(1));
        (total.max(0) + page_size - 1) / page_size
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StockPage {
    pub stocks: Vec<Stock>,
    pub total: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndustryCount {
    pub industry: String,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use super::{SortOrder, StockCode, StockCriteria, StockListQuery, StockSortField};

    #[test]
    fn numeric_codes_are_zero_padded() {
        assert_eq!(StockCode::from_number(1).as_str(), "000001");
        assert_eq!(StockCode::from_number(600000).as_str(), "600000");
    }

    #[test]
    fn default_criteria_is_unbounded() {
        assert!(StockCriteria::default().is_unbounded());
        let bounded = StockCriteria { max_pe: Some(10.0), ..StockCriteria::default() };
        assert!(!bounded.is_unbounded());
    }

    #[test]
    fn sort_options_fall_back_to_code_ascending() {
        assert_eq!(StockSortField::parse("market_cap").column(), "total_market_cap");
        assert_eq!(StockSortField::parse("updated_at"), StockSortField::Code);
        assert_eq!(SortOrder::parse("DESC"), SortOrder::Desc);
        assert_eq!(SortOrder::parse("sideways"), SortOrder::Asc);
    }

    #[test]
    fn pagination_math() {
        let query = StockListQuery { page: 3, page_size: 20, ..StockListQuery::default() };
        assert_eq!(query.offset(), 40);
        assert_eq!(query.total_pages(0), 0);
        assert_eq!(query.total_pages(41), 3);
        let first = StockListQuery { page: 0, ..StockListQuery::default() };
        assert_eq!(first.offset(), 0);
    }
}

pub mod config;
pub mod domain;

pub use config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
pub use domain::stock::{
    IndustryCount, SortOrder, Stock, StockCode, StockCriteria, StockDaily, StockListQuery,
    StockPage, StockSortField,
};

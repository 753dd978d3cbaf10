use serde_json::json;
use stockpilot_core::domain::stock::DATE_FORMAT;
use stockpilot_db::{SqlStockRepository, StockRepository};

use crate::commands::{async_runtime, load_config, migrated_pool, CommandResult, Failure};

pub fn run() -> CommandResult {
    let config = match load_config("stats") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match async_runtime("stats") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let repository = SqlStockRepository::new(pool.clone());

        let counted = async {
            let stocks = repository.count_stocks().await?;
            let daily_records = repository.count_daily_records().await?;
            let latest = repository.latest_trade_date().await?;
            Ok::<_, stockpilot_db::RepositoryError>((stocks, daily_records, latest))
        }
        .await
        .map_err(|error| ("query_execution", error.to_string(), 3u8));

        pool.close().await;
        counted
    });

    match result {
        Ok((stocks, daily_records, latest)) => {
            let latest = latest.map(|date| date.format(DATE_FORMAT).to_string());
            CommandResult::success_with_detail(
                "stats",
                format!(
                    "{stocks} stocks, {daily_records} daily records, latest trade date {}",
                    latest.as_deref().unwrap_or("none")
                ),
                Some(json!({
                    "total_stocks": stocks,
                    "total_daily_records": daily_records,
                    "latest_trade_date": latest,
                })),
            )
        }
        Err::<_, Failure>(failure) => CommandResult::from_failure("stats", failure),
    }
}

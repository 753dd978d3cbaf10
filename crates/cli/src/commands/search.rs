use serde_json::{json, Value};
use stockpilot_db::{SqlStockRepository, StockRepository};

use crate::commands::{async_runtime, load_config, migrated_pool, CommandResult, Failure};

const SEARCH_LIMIT: u32 = 20;

pub fn run(keyword: &str) -> CommandResult {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return CommandResult::failure("search", "invalid_input", "keyword must not be empty", 2);
    }

    let config = match load_config("search") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match async_runtime("search") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;
        let found = SqlStockRepository::new(pool.clone())
            .search_by_keyword_or_name(keyword, SEARCH_LIMIT)
            .await
            .map_err(|error| ("query_execution", error.to_string(), 3u8));
        pool.close().await;
        found
    });

    match result {
        Ok(stocks) if stocks.is_empty() => CommandResult::success_with_detail(
            "search",
            format!("no stocks match '{keyword}'"),
            Some(Value::Array(Vec::new())),
        ),
        Ok(stocks) => {
            let rows: Vec<Value> = stocks
                .iter()
                .map(|stock| {
                    json!({
                        "code": stock.code,
                        "name": stock.name,
                        "industry": stock.industry,
                        "pe_ratio": stock.pe_ratio,
                        "market_cap": stock.total_market_cap,
                    })
                })
                .collect();
            CommandResult::success_with_detail(
                "search",
                format!("{} stocks match '{keyword}'", rows.len()),
                Some(Value::Array(rows)),
            )
        }
        Err::<_, Failure>(failure) => CommandResult::from_failure("search", failure),
    }
}

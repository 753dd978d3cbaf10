use serde_json::json;
use stockpilot_db::DemoDataset;

use crate::commands::{async_runtime, load_config, migrated_pool, CommandResult, Failure};

pub fn run() -> CommandResult {
    let config = match load_config("seed") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match async_runtime("seed") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = migrated_pool(&config).await?;

        let outcome = async {
            let loaded = DemoDataset::load(&pool)
                .await
                .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;
            let verification = DemoDataset::verify(&pool)
                .await
                .map_err(|error| ("seed_verification", error.to_string(), 7u8))?;

            if verification.all_present {
                Ok(loaded)
            } else {
                let failed = verification
                    .checks
                    .iter()
                    .filter_map(|(check, passed)| (!passed).then_some(*check))
                    .collect::<Vec<_>>();
                Err(("seed_verification", verification_message(&failed), 7u8))
            }
        }
        .await;

        pool.close().await;
        outcome
    });

    match result {
        Ok(loaded) => CommandResult::success_with_detail(
            "seed",
            format!(
                "demo dataset loaded: {} stocks, {} daily bars",
                loaded.stocks, loaded.daily_bars
            ),
            Some(json!({ "stocks": loaded.stocks, "daily_bars": loaded.daily_bars })),
        ),
        Err::<_, Failure>(failure) => CommandResult::from_failure("seed", failure),
    }
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "demo dataset failed to load".to_string()
    } else {
        format!("demo dataset verification failed for: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_message_names_failed_checks() {
        assert_eq!(
            verification_message(&["600519", "daily-bars"]),
            "demo dataset verification failed for: 600519, daily-bars"
        );
        assert_eq!(verification_message(&[]), "demo dataset failed to load");
    }
}

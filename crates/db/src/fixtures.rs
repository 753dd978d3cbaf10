use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const SEED_STOCK_CODES: &[&str] = &["600000", "000001", "600519", "000002"];
const SEED_DAILY_CODES: &[&str] = &["600000", "000001", "600519"];
const SEED_TRADING_DAYS: i64 = 5;

/// Demo dataset used by `stockpilot seed`, the server smoke path and tests.
///
/// Loading is idempotent: rows are keyed by stock code and `(code, trade_date)`
/// and replaced on reload.
pub struct DemoDataset;

impl DemoDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_stocks.sql");

    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let quoted = sql_array_from_codes(SEED_STOCK_CODES);
        let stocks: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(1) FROM stocks WHERE code IN {quoted}"))
                .fetch_one(pool)
                .await?;
        let daily_bars: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM stock_daily WHERE code IN {quoted}"
        ))
        .fetch_one(pool)
        .await?;

        Ok(SeedResult { stocks, daily_bars })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for code in SEED_STOCK_CODES {
            let exists: i64 =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM stocks WHERE code = ?1)")
                    .bind(code)
                    .fetch_one(pool)
                    .await?;
            checks.push((*code, exists == 1));
        }

        for code in SEED_DAILY_CODES {
            let bars: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM stock_daily WHERE code = ?1")
                    .bind(code)
                    .fetch_one(pool)
                    .await?;
            if bars != SEED_TRADING_DAYS {
                checks.push(("daily-bars", false));
            }
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let quoted = sql_array_from_codes(SEED_STOCK_CODES);
        let mut tx = pool.begin().await?;

        sqlx::query(&format!("DELETE FROM stock_daily WHERE code IN {quoted}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM stocks WHERE code IN {quoted}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn sql_array_from_codes(codes: &[&str]) -> String {
    let quoted = codes.iter().map(|code| format!("'{code}'")).collect::<Vec<_>>().join(", ");
    format!("({quoted})")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedResult {
    pub stocks: i64,
    pub daily_bars: i64,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_with_settings, migrations};

    #[test]
    fn sql_fixture_is_valid() {
        assert!(DemoDataset::SQL.contains("INSERT OR REPLACE INTO stocks"));
        assert!(DemoDataset::SQL.contains("INSERT OR REPLACE INTO stock_daily"));
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoDataset::load(&pool).await.expect("load demo dataset");
        let second = DemoDataset::load(&pool).await.expect("reload demo dataset");

        assert_eq!(first, SeedResult { stocks: 4, daily_bars: 15 });
        assert_eq!(first, second);
        assert!(DemoDataset::verify(&pool).await.expect("verify").all_present);
    }

    #[tokio::test]
    async fn clean_removes_seeded_rows() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        DemoDataset::load(&pool).await.expect("load demo dataset");
        DemoDataset::clean(&pool).await.expect("clean demo dataset");

        let verification = DemoDataset::verify(&pool).await.expect("verify");
        assert!(!verification.all_present);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM stock_daily")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(remaining, 0);
    }
}

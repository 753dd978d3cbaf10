use std::sync::Arc;

use stockpilot_agent::{build_client, AgentRuntime, LlmError, SqlGuardPolicy, ToolRegistry};
use stockpilot_core::config::{AppConfig, ConfigError, LoadOptions};
use stockpilot_db::{
    connect_with_settings, migrations, DbPool, SqlStockRepository, StockRepository,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub stock_repository: Arc<dyn StockRepository>,
    pub agent_runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client setup failed: {0}")]
    Llm(#[from] LlmError),
}

#[cfg(test)]
pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        provider = config.llm.provider.as_str(),
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let client = build_client(&config.llm)?;
    let stock_repository: Arc<dyn StockRepository> =
        Arc::new(SqlStockRepository::new(db_pool.clone()));
    let tools = ToolRegistry::stock_tools(
        stock_repository.clone(),
        SqlGuardPolicy::new(config.agent.sql_default_limit, config.agent.sql_max_limit),
    );
    let agent_runtime =
        Arc::new(AgentRuntime::new(client, Arc::new(tools), config.agent.max_iterations));
    info!(
        event_name = "system.bootstrap.agent_ready",
        correlation_id = "bootstrap",
        provider = agent_runtime.provider(),
        tools = agent_runtime.tools().len(),
        max_iterations = config.agent.max_iterations,
        "agent runtime initialized"
    );

    Ok(Application { config, db_pool, stock_repository, agent_runtime })
}

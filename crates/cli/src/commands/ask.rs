use std::sync::Arc;

use serde_json::json;
use stockpilot_agent::{build_client, AgentRuntime, Message, SqlGuardPolicy, ToolRegistry};
use stockpilot_db::SqlStockRepository;

use crate::commands::{async_runtime, load_config, migrated_pool, CommandResult, Failure};

/// One-shot conversation through the configured provider.
pub fn run(question: &str, system: Option<&str>) -> CommandResult {
    if question.trim().is_empty() {
        return CommandResult::failure("ask", "invalid_input", "question must not be empty", 2);
    }

    let config = match load_config("ask") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match async_runtime("ask") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let client =
            build_client(&config.llm).map_err(|error| ("llm_setup", error.to_string(), 6u8))?;
        let pool = migrated_pool(&config).await?;

        let tools = ToolRegistry::stock_tools(
            Arc::new(SqlStockRepository::new(pool.clone())),
            SqlGuardPolicy::new(config.agent.sql_default_limit, config.agent.sql_max_limit),
        );
        let agent = AgentRuntime::new(client, Arc::new(tools), config.agent.max_iterations);

        let mut transcript = Vec::with_capacity(2);
        if let Some(system) = system {
            transcript.push(Message::system(system));
        }
        transcript.push(Message::user(question));

        let turn = agent.run(transcript).await;
        pool.close().await;
        Ok::<_, Failure>(turn)
    });

    match result {
        Ok(turn) => CommandResult::success_with_detail(
            "ask",
            turn.content.unwrap_or_default(),
            Some(json!({
                "provider": config.llm.provider.as_str(),
                "rounds": turn.rounds,
                "tool_calls_dispatched": turn.dispatched,
            })),
        ),
        Err(failure) => CommandResult::from_failure("ask", failure),
    }
}

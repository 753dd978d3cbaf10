use serde_json::Value;
use stockpilot_agent::tools::catalog;

use crate::commands::CommandResult;

/// Prints the tool catalog in the function-calling schema sent to providers.
pub fn run() -> CommandResult {
    let schemas = catalog::function_schemas();
    let names = catalog::definitions().iter().map(|tool| tool.name).collect::<Vec<_>>();

    CommandResult::success_with_detail(
        "tools",
        format!("{} tools: {}", names.len(), names.join(", ")),
        Some(Value::Array(schemas)),
    )
}

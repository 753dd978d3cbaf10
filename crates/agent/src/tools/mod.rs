//! Tool dispatch: name lookup, argument validation and uniform JSON payloads.
//!
//! `ToolRegistry::dispatch` never fails. Every error, from an unknown tool
//! name to a storage failure, is reported to the model as
//! `{"success": false, "message": ...}` so the conversation can continue.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use stockpilot_core::domain::stock::StockCode;
use stockpilot_db::{RepositoryError, StockRepository};

use crate::conversation::{ToolArguments, ToolInvocationRequest};
use crate::guardrails::SqlGuardPolicy;

pub mod catalog;
pub mod sql;
pub mod stock;

pub use catalog::ToolDefinition;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("未知的工具: {0}")]
    UnknownTool(String),
    #[error("缺少必需参数: {0}")]
    MissingArgument(String),
    #[error("参数 {name} 无效: {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("工具参数不是合法的 JSON 对象: {0}")]
    MalformedArguments(String),
    #[error("数据查询失败: {0}")]
    Storage(#[from] RepositoryError),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// Outcome of one invocation, keyed by the vendor's invocation id.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub invocation_id: String,
    pub success: bool,
    pub payload: String,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    /// The six stock tools of the catalog, backed by `repository`.
    pub fn stock_tools(repository: Arc<dyn StockRepository>, sql_policy: SqlGuardPolicy) -> Self {
        let mut registry = Self::default();
        registry.register(stock::SearchStock::new(repository.clone()));
        registry.register(stock::GetStockDetail::new(repository.clone()));
        registry.register(stock::GetStockHistory::new(repository.clone()));
        registry.register(stock::FilterStocks::new(repository.clone()));
        registry.register(stock::GetDatabaseStats::new(repository.clone()));
        registry.register(sql::ExecuteSqlQuery::new(repository, sql_policy));
        registry
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, name: &str, arguments: &Map<String, Value>) -> String {
        self.run(name, arguments).await.to_string()
    }

    pub async fn dispatch_request(&self, request: &ToolInvocationRequest) -> ToolResult {
        let payload = match &request.arguments {
            ToolArguments::Parsed(arguments) => self.run(&request.name, arguments).await,
            ToolArguments::Malformed { raw, error } => {
                warn!(
                    event_name = "agent.tool.malformed_arguments",
                    tool = %request.name,
                    invocation_id = %request.id,
                    raw_arguments = %raw,
                    "tool arguments could not be parsed"
                );
                failure(&ToolError::MalformedArguments(error.clone()))
            }
        };

        ToolResult {
            invocation_id: request.id.clone(),
            success: payload_succeeded(&payload),
            payload: payload.to_string(),
        }
    }

    async fn run(&self, name: &str, arguments: &Map<String, Value>) -> Value {
        let Some(tool) = self.tools.get(name) else {
            warn!(event_name = "agent.tool.unknown", tool = %name, "model requested unknown tool");
            return failure(&ToolError::UnknownTool(name.to_string()));
        };

        if let Some(definition) = catalog::find(name) {
            let missing = definition
                .required()
                .into_iter()
                .find(|required| arguments.get(*required).map_or(true, Value::is_null));
            if let Some(missing) = missing {
                return failure(&ToolError::MissingArgument(missing.to_string()));
            }
        }

        let rendered_arguments = Value::Object(arguments.clone());
        debug!(
            event_name = "agent.tool.arguments",
            tool = %name,
            arguments = %rendered_arguments,
            "dispatching tool"
        );

        let payload = match tool.execute(arguments).await {
            Ok(payload) => payload,
            Err(error) => failure(&error),
        };
        let success = payload_succeeded(&payload);
        info!(
            event_name = "agent.tool.dispatched",
            tool = %name,
            success,
            "tool dispatch finished"
        );
        payload
    }
}

fn payload_succeeded(payload: &Value) -> bool {
    payload.get("success").and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn failure(error: &ToolError) -> Value {
    failure_message(error.to_string())
}

pub(crate) fn failure_message(message: impl Into<String>) -> Value {
    json!({ "success": false, "message": message.into() })
}

fn invalid(name: &str, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidArgument { name: name.to_string(), reason: reason.into() }
}

fn present<'a>(arguments: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    arguments.get(name).filter(|value| !value.is_null())
}

/// Stock codes may arrive as strings or as bare integers that lost their
/// leading zeros.
pub(crate) fn stock_code_arg(
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<StockCode, ToolError> {
    match present(arguments, name) {
        Some(Value::String(code)) if !code.trim().is_empty() => {
            Ok(StockCode(code.trim().to_string()))
        }
        Some(Value::Number(number)) => number
            .as_u64()
            .map(StockCode::from_number)
            .ok_or_else(|| invalid(name, "股票代码必须是非负整数或字符串")),
        Some(_) => Err(invalid(name, "股票代码必须是字符串")),
        None => Err(ToolError::MissingArgument(name.to_string())),
    }
}

pub(crate) fn required_string(
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<String, ToolError> {
    match present(arguments, name) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        Some(_) => Err(invalid(name, "必须是字符串")),
        None => Err(ToolError::MissingArgument(name.to_string())),
    }
}

pub(crate) fn optional_string(
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<Option<String>, ToolError> {
    match present(arguments, name) {
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.trim().to_string())),
        Some(_) => Err(invalid(name, "必须是字符串")),
        None => Ok(None),
    }
}

pub(crate) fn optional_integer(
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<Option<i64>, ToolError> {
    match present(arguments, name) {
        Some(Value::Number(number)) => {
            if let Some(value) = number.as_i64() {
                return Ok(Some(value));
            }
            match number.as_f64() {
                Some(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
                    Ok(Some(value as i64))
                }
                _ => Err(invalid(name, "必须是整数")),
            }
        }
        Some(Value::String(text)) => {
            text.trim().parse::<i64>().map(Some).map_err(|_| invalid(name, "必须是整数"))
        }
        Some(_) => Err(invalid(name, "必须是整数")),
        None => Ok(None),
    }
}

pub(crate) fn optional_number(
    arguments: &Map<String, Value>,
    name: &str,
) -> Result<Option<f64>, ToolError> {
    match present(arguments, name) {
        Some(Value::Number(number)) => number.as_f64().map(Some).ok_or_else(|| invalid(name, "必须是数字")),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(name, "必须是数字")),
        Some(_) => Err(invalid(name, "必须是数字")),
        None => Ok(None),
    }
}

/// Positive row limit with a fallback and a ceiling.
pub(crate) fn bounded_limit(requested: Option<i64>, default: u32, ceiling: u32) -> u32 {
    match requested {
        Some(value) if value > 0 => u32::try_from(value).unwrap_or(ceiling).min(ceiling),
        _ => default,
    }
}

use std::sync::OnceLock;

use serde_json::{json, Value};

/// A tool as advertised to the model: unique name, description and a JSON
/// schema for its parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// `{type: "function", function: {name, description, parameters}}`
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

pub const SEARCH_STOCK: &str = "search_stock";
pub const GET_STOCK_DETAIL: &str = "get_stock_detail";
pub const GET_STOCK_HISTORY: &str = "get_stock_history";
pub const FILTER_STOCKS: &str = "filter_stocks";
pub const EXECUTE_SQL_QUERY: &str = "execute_sql_query";
pub const GET_DATABASE_STATS: &str = "get_database_stats";

pub fn definitions() -> &'static [ToolDefinition] {
    static CATALOG: OnceLock<Vec<ToolDefinition>> = OnceLock::new();
    CATALOG.get_or_init(build_catalog)
}

pub fn find(name: &str) -> Option<&'static ToolDefinition> {
    definitions().iter().find(|definition| definition.name == name)
}

pub fn function_schemas() -> Vec<Value> {
    definitions().iter().map(ToolDefinition::to_function_schema).collect()
}

fn build_catalog() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: SEARCH_STOCK,
            description: "搜索股票，可以通过股票代码或名称关键词搜索",
            parameters: json!({
                "type": "object",
                "properties": {
                    "keyword": {
                        "type": "string",
                        "description": "股票代码或名称关键词，例如：'600000' 或 '平安银行'"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "返回结果数量限制，默认10",
                        "default": 10
                    }
                },
                "required": ["keyword"]
            }),
        },
        ToolDefinition {
            name: GET_STOCK_DETAIL,
            description: "获取指定股票的详细信息，包括财务指标、市值等",
            parameters: json!({
                "type": "object",
                "properties": {
                    "stock_code": {
                        "type": "string",
                        "description": "股票代码，例如：'600000', '000001'"
                    }
                },
                "required": ["stock_code"]
            }),
        },
        ToolDefinition {
            name: GET_STOCK_HISTORY,
            description: "获取股票的历史行情数据，包括价格、成交量等",
            parameters: json!({
                "type": "object",
                "properties": {
                    "stock_code": {
                        "type": "string",
                        "description": "股票代码，例如：'600000'"
                    },
                    "days": {
                        "type": "integer",
                        "description": "获取最近多少天的数据，默认30天",
                        "default": 30
                    }
                },
                "required": ["stock_code"]
            }),
        },
        ToolDefinition {
            name: FILTER_STOCKS,
            description: "根据条件筛选股票，支持按市盈率、市净率、市值、行业等条件筛选",
            parameters: json!({
                "type": "object",
                "properties": {
                    "min_pe": { "type": "number", "description": "最小市盈率" },
                    "max_pe": { "type": "number", "description": "最大市盈率" },
                    "min_pb": { "type": "number", "description": "最小市净率" },
                    "max_pb": { "type": "number", "description": "最大市净率" },
                    "min_market_cap": { "type": "number", "description": "最小市值(亿元)" },
                    "max_market_cap": { "type": "number", "description": "最大市值(亿元)" },
                    "industry": { "type": "string", "description": "行业关键词" },
                    "limit": {
                        "type": "integer",
                        "description": "返回结果数量限制，默认20",
                        "default": 20
                    }
                },
                "required": []
            }),
        },
        ToolDefinition {
            name: EXECUTE_SQL_QUERY,
            description: "执行只读 SQL 查询，仅允许 SELECT 语句。可用表：stocks(code, name, market, \
                          industry, list_date, total_assets, net_assets, pe_ratio, pb_ratio, roe, \
                          total_market_cap, circulating_market_cap, turnover_rate, updated_at)；\
                          stock_daily(code, trade_date, open, close, high, low, volume, amount, \
                          change, pct_change, total_market_cap, circulating_market_cap, \
                          turnover_rate)。市值单位为亿元",
            parameters: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "单条 SELECT 语句"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "返回行数上限，默认100，最大500",
                        "default": 100
                    }
                },
                "required": ["sql"]
            }),
        },
        ToolDefinition {
            name: GET_DATABASE_STATS,
            description: "获取数据库统计信息，包括股票总数、数据记录数、最新交易日期等",
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{definitions, find, function_schemas};

    #[test]
    fn catalog_has_six_uniquely_named_tools() {
        let names: HashSet<&str> = definitions().iter().map(|definition| definition.name).collect();
        assert_eq!(definitions().len(), 6);
        assert_eq!(names.len(), 6);
        for name in [
            "search_stock",
            "get_stock_detail",
            "get_stock_history",
            "filter_stocks",
            "execute_sql_query",
            "get_database_stats",
        ] {
            assert!(names.contains(name), "missing {name}");
        }
    }

    #[test]
    fn required_parameters_are_declared_properties() {
        for definition in definitions() {
            let properties = &definition.parameters["properties"];
            for required in definition.required() {
                assert!(
                    properties.get(required).is_some(),
                    "{} requires undeclared {required}",
                    definition.name
                );
            }
        }
        assert_eq!(find("execute_sql_query").map(|d| d.required()), Some(vec!["sql"]));
        assert!(find("drop_table").is_none());
    }

    #[test]
    fn function_schemas_use_the_function_envelope() {
        for schema in function_schemas() {
            assert_eq!(schema["type"], "function");
            assert!(schema["function"]["name"].is_string());
            assert_eq!(schema["function"]["parameters"]["type"], "object");
        }
    }
}

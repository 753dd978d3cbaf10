use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use stockpilot_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// One effective setting: dotted key, rendered value and the env var that
/// overrides it.
struct Setting {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = detect_config_path();
    let file_doc = file_path.as_deref().and_then(load_config_file_doc);

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(settings(&config).into_iter().map(|setting| {
        let source = field_source(&setting, file_doc.as_ref(), file_path.as_deref());
        format!("- {} = {} (source: {source})", setting.key, setting.value)
    }));
    lines.join("\n")
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let setting = |key, value: String, env_key| Setting { key, value, env_key };

    vec![
        setting("database.url", config.database.url.clone(), "STOCKPILOT_DATABASE_URL"),
        setting(
            "database.max_connections",
            config.database.max_connections.to_string(),
            "STOCKPILOT_DATABASE_MAX_CONNECTIONS",
        ),
        setting(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "STOCKPILOT_DATABASE_TIMEOUT_SECS",
        ),
        setting("llm.provider", config.llm.provider.as_str().to_string(), "STOCKPILOT_LLM_PROVIDER"),
        setting("llm.model", config.llm.model.clone(), "STOCKPILOT_LLM_MODEL"),
        setting(
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "STOCKPILOT_LLM_BASE_URL",
        ),
        setting("llm.api_key", redact_key(config.llm.api_key.as_ref()), "STOCKPILOT_LLM_API_KEY"),
        setting(
            "llm.timeout_secs",
            config.llm.timeout_secs.to_string(),
            "STOCKPILOT_LLM_TIMEOUT_SECS",
        ),
        setting("llm.max_tokens", config.llm.max_tokens.to_string(), "STOCKPILOT_LLM_MAX_TOKENS"),
        setting(
            "agent.max_iterations",
            config.agent.max_iterations.to_string(),
            "STOCKPILOT_AGENT_MAX_ITERATIONS",
        ),
        setting(
            "agent.sql_default_limit",
            config.agent.sql_default_limit.to_string(),
            "STOCKPILOT_AGENT_SQL_DEFAULT_LIMIT",
        ),
        setting(
            "agent.sql_max_limit",
            config.agent.sql_max_limit.to_string(),
            "STOCKPILOT_AGENT_SQL_MAX_LIMIT",
        ),
        setting(
            "server.bind_address",
            config.server.bind_address.clone(),
            "STOCKPILOT_SERVER_BIND_ADDRESS",
        ),
        setting("server.port", config.server.port.to_string(), "STOCKPILOT_SERVER_PORT"),
        setting("logging.level", config.logging.level.clone(), "STOCKPILOT_LOGGING_LEVEL"),
        setting(
            "logging.format",
            format!("{:?}", config.logging.format).to_lowercase(),
            "STOCKPILOT_LOGGING_FORMAT",
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("stockpilot.toml"), PathBuf::from("config/stockpilot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: &Path) -> Option<Value> {
    fs::read_to_string(path).ok()?.parse::<Value>().ok()
}

fn field_source(setting: &Setting, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if env::var_os(setting.env_key).is_some() {
        return format!("env ({})", setting.env_key);
    }

    if file_doc.is_some_and(|doc| contains_path(doc, setting.key)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    key_path.split('.').try_fold(root, |current, key| current.get(key)).is_some()
}

/// Keeps a provider prefix such as `sk-` and hides the rest.
fn redact_key(key: Option<&SecretString>) -> String {
    let Some(key) = key else {
        return "<unset>".to_string();
    };
    let trimmed = key.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{contains_path, redact_key};

    #[test]
    fn keys_keep_only_their_prefix() {
        let openai = SecretString::from("sk-abc123".to_string());
        let opaque = SecretString::from("abcdef".to_string());

        assert_eq!(redact_key(Some(&openai)), "sk-***");
        assert_eq!(redact_key(Some(&opaque)), "<redacted>");
        assert_eq!(redact_key(None), "<unset>");
    }

    #[test]
    fn dotted_paths_resolve_through_tables() {
        let doc: toml::Value = "[llm]\nmodel = \"qwen2.5\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.api_key"));
        assert!(!contains_path(&doc, "server.port"));
    }
}

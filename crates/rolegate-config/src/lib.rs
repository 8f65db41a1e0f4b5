use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_NO_RESPONSE_MESSAGE: &str = "It's been a week, but we haven't heard anything from you, \
so I'm going ahead and denying the request. Please write to us if you are still \
interested in joining the project";

pub const MAX_REPLY_TIMEOUT_MS: u64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub policy: Policy,
    #[serde(default)]
    pub conversation: Conversation,
    pub mail: Mail,
    pub membership: Membership,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub url_template: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_reply_match")]
    pub reply_match: String,
    #[serde(default = "default_no_response_message")]
    pub no_response_message: String,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            reply_match: default_reply_match(),
            no_response_message: default_no_response_message(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mail {
    pub relay_endpoint: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    pub owner_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub endpoint: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
}

fn default_max_redirects() -> usize {
    5
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_reply_timeout_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_reply_match() -> String {
    "line".to_string()
}

fn default_no_response_message() -> String {
    DEFAULT_NO_RESPONSE_MESSAGE.to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !cfg.policy.url_template.contains("${project}") {
        return Err(ConfigError::UnsupportedConfig(
            "policy.url_template must contain ${project}".to_string(),
        ));
    }
    if cfg.policy.max_redirects == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "policy.max_redirects must be >= 1".to_string(),
        ));
    }
    if cfg.conversation.reply_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "conversation.reply_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.conversation.reply_timeout_ms > MAX_REPLY_TIMEOUT_MS {
        return Err(ConfigError::UnsupportedConfig(format!(
            "conversation.reply_timeout_ms must be <= {MAX_REPLY_TIMEOUT_MS}"
        )));
    }
    if cfg.conversation.reply_match != "line" && cfg.conversation.reply_match != "prefix" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "conversation.reply_match={} is not implemented; supported: line, prefix",
            cfg.conversation.reply_match
        )));
    }
    if cfg.mail.timeout_ms == 0 || cfg.membership.timeout_ms == 0 || cfg.policy.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "timeouts must be >= 1".to_string(),
        ));
    }
    Ok(())
}

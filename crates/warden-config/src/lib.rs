use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

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
    #[serde(default)]
    pub engine: Engine,
    pub identity: Identity,
    #[serde(default)]
    pub policy: Policy,
    pub audit: Audit,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    #[serde(default = "default_request_time_tolerance_secs")]
    pub request_time_tolerance_secs: u64,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            request_time_tolerance_secs: default_request_time_tolerance_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    /// Hex-encoded 32-byte Ed25519 seed.
    pub seed_hex: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub auto_approve: AutoApprove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApprove {
    #[serde(default)]
    pub ssh: bool,
    #[serde(default)]
    pub git: bool,
    #[serde(default)]
    pub hosts: bool,
    #[serde(default = "default_true")]
    pub me: bool,
}

impl Default for AutoApprove {
    fn default() -> Self {
        Self {
            ssh: false,
            git: false,
            hosts: false,
            me: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routing {
    #[serde(default = "default_endpoint_secret")]
    pub endpoint_secret: String,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            endpoint_secret: default_endpoint_secret(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

fn default_request_time_tolerance_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_endpoint_secret() -> String {
    "WARDEN_ENDPOINT".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
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
    if cfg.engine.request_time_tolerance_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "engine.request_time_tolerance_secs must be >= 1".to_string(),
        ));
    }
    if cfg.identity.seed_hex.len() != 64
        || !cfg.identity.seed_hex.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(ConfigError::UnsupportedConfig(
            "identity.seed_hex must be 64 hex characters".to_string(),
        ));
    }
    if cfg.audit.jsonl_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "audit.jsonl_path is required".to_string(),
        ));
    }
    if cfg
        .audit
        .sqlite_path
        .as_ref()
        .map(|v| v.trim().is_empty())
        .unwrap_or(false)
    {
        return Err(ConfigError::UnsupportedConfig(
            "audit.sqlite_path must not be empty when set".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for session in &cfg.sessions {
        if session.id.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "sessions[].id must not be empty".to_string(),
            ));
        }
        if !seen.insert(session.id.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "sessions[].id={} is duplicated",
                session.id
            )));
        }
        if let Some(url) = &session.callback_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "sessions[{}].callback_url must be http(s)",
                    session.id
                )));
            }
        }
    }
    Ok(())
}

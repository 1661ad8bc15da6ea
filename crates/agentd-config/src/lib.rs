use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    4180
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// SQLite storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file. Defaults to `~/.agentd/agentd.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the queue-draining heartbeat.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// External command that performs the actual agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Program to run. The task description is appended as the last argument.
    /// When unset, dispatches are logged and acknowledged without doing work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Top-level agentd configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentdConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl AgentdConfig {
    /// Configured database path, or `agentd.db` inside the config directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.path {
            Some(path) => Ok(path.clone()),
            None => Ok(ensure_config_dir()?.join("agentd.db")),
        }
    }
}

/// Environment variables that override the file, read after `.env` is loaded.
pub const ENV_PORT: &str = "AGENTD_PORT";
pub const ENV_AUTH_TOKEN: &str = "AGENTD_AUTH_TOKEN";
pub const ENV_DB_PATH: &str = "AGENTD_DB_PATH";
pub const ENV_EXECUTOR_COMMAND: &str = "AGENTD_EXECUTOR_COMMAND";

impl AgentdConfig {
    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT) {
            self.gateway.port = port.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_PORT} is not a port number: {port}"))
            })?;
        }
        if let Some(token) = lookup(ENV_AUTH_TOKEN).filter(|t| !t.is_empty()) {
            self.gateway.auth_token = Some(token);
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.is_empty()) {
            self.storage.path = Some(PathBuf::from(path));
        }
        if let Some(command) = lookup(ENV_EXECUTOR_COMMAND).filter(|c| !c.is_empty()) {
            self.executor.command = Some(command);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.heartbeat_secs must be at least 1".into(),
            ));
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "executor.timeout_secs must be at least 1".into(),
            ));
        }
        if self.executor.command.as_deref().is_some_and(|c| c.trim().is_empty()) {
            return Err(ConfigError::Invalid("executor.command is empty".into()));
        }
        Ok(())
    }
}

/// `~/.agentd`
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".agentd"))
        .ok_or(ConfigError::NoDirFound)
}

pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load `~/.agentd/config.json5` with environment overrides applied.
pub fn load_config() -> Result<AgentdConfig, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    let mut config = load_config_from(&config_file_path()?)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Parse a config file. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<AgentdConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(AgentdConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    Ok(json5::from_str(&content)?)
}

pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Write `config` to `path` unless a file is already there.
///
/// Returns `false` when an existing file was left untouched.
pub fn write_config_if_absent(path: &Path, config: &AgentdConfig) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(true)
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use amelie_types::ChannelConfig;

/// Environment variable holding the Telegram bot token.
pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
/// Environment variable holding the description engine API key.
pub const ENV_ENGINE_API_KEY: &str = "GEMINI_API_KEY";
/// Environment variable overriding the engine model.
pub const ENV_ENGINE_MODEL: &str = "AMELIE_MODEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid setting: {0}")]
    Invalid(&'static str),
}

/// Gateway process settings (health endpoint, inbound queue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Serve `GET /health` over HTTP.
    #[serde(default)]
    pub health_enabled: bool,
    /// Port for the health endpoint.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind the health endpoint to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Capacity of the inbound message queue shared by all channels.
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_inbound_buffer() -> usize {
    256
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_enabled: false,
            port: default_port(),
            host: default_host(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

/// Description engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// API key for the engine (overridden by `GEMINI_API_KEY`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pause before the single retry, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Language the descriptions are written in.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_model() -> String {
    "gemini-2.5-flash-lite".to_string()
}

fn default_timeout_secs() -> u64 {
    90
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_language() -> String {
    "English".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            language: default_language(),
        }
    }
}

/// Local storage locations. Unset paths resolve under `~/.amelie/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding per-conversation settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<PathBuf>,
    /// Directory for in-flight media files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spool_dir: Option<PathBuf>,
}

/// Media pipeline limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Largest payload accepted, in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
    /// Upper bound on events processed at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_payload_bytes() -> u64 {
    // Telegram bots cannot download files above 20 MiB.
    20 * 1024 * 1024
}

fn default_max_concurrent() -> usize {
    8
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Top-level amelie configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AmelieConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Named channel configurations.
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
}

impl AmelieConfig {
    /// Apply environment overrides using the given lookup.
    ///
    /// `TELEGRAM_TOKEN` fills the bot token of every telegram channel that
    /// lacks one, and creates a `telegram` channel when none is configured.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_ENGINE_API_KEY).filter(|v| !v.is_empty()) {
            self.engine.api_key = Some(key);
        }
        if let Some(model) = lookup(ENV_ENGINE_MODEL).filter(|v| !v.is_empty()) {
            self.engine.model = model;
        }
        if let Some(token) = lookup(ENV_TELEGRAM_TOKEN).filter(|v| !v.is_empty()) {
            let mut found = false;
            for channel in self
                .channels
                .values_mut()
                .filter(|c| c.channel_type == "telegram")
            {
                found = true;
                channel
                    .settings
                    .entry("bot_token".to_string())
                    .or_insert_with(|| serde_json::Value::String(token.clone()));
            }
            if !found {
                let mut settings = HashMap::new();
                settings.insert("bot_token".to_string(), serde_json::Value::String(token));
                self.channels.insert(
                    "telegram".to_string(),
                    ChannelConfig {
                        channel_type: "telegram".to_string(),
                        enabled: true,
                        settings,
                    },
                );
            }
        }
    }

    /// Check the settings needed to run the bot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::Missing("engine.api_key / GEMINI_API_KEY"));
        }
        if !self.channels.values().any(|c| c.enabled) {
            return Err(ConfigError::Missing("channels / TELEGRAM_TOKEN"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(ConfigError::Invalid("engine.timeout_secs must be at least 1"));
        }
        Ok(())
    }

    /// Resolved SQLite database path.
    pub fn db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.db_path {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("amelie.db")),
        }
    }

    /// Resolved spool directory for in-flight media.
    pub fn spool_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.spool_dir {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("spool")),
        }
    }
}

/// Resolve the amelie config directory (~/.amelie/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".amelie"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.amelie/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from `path` (or the default path), then apply `.env`
/// and process environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<AmelieConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    let mut config = load_config_from(&path)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<AmelieConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(AmelieConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: AmelieConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Write configuration to `path`, creating parent directories.
pub fn save_config_to(config: &AmelieConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

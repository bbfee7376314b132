//! Configuration loading, validation, and management for Loomweave.
//!
//! Loads configuration from `~/.loomweave/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use loomweave_variables::MergeOperation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.loomweave/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Default model endpoint, used when a request names no llm-config asset
    #[serde(default)]
    pub llm: LlmSettings,

    /// Prompt pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Where conversations, variables and assets live
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Maximum request body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit: usize,
}

fn default_port() -> u16 {
    42800
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            body_limit: default_body_limit(),
        }
    }
}

/// OpenAI-compatible endpoint settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.8
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// View used when a request does not specify one (`user` or `model`)
    #[serde(default = "default_view")]
    pub default_view: String,

    /// How many history items (newest first) keyword world-book entries scan
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,

    /// Upper bound for a single hook callback
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: u64,

    /// How computed variables are written back to storage
    #[serde(default = "default_variable_persist")]
    pub variable_persist: MergeOperation,
}

fn default_view() -> String {
    "model".into()
}
fn default_scan_depth() -> usize {
    4
}
fn default_hook_timeout_ms() -> u64 {
    5_000
}
fn default_variable_persist() -> MergeOperation {
    MergeOperation::Replace
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_view: default_view(),
            scan_depth: default_scan_depth(),
            hook_timeout_ms: default_hook_timeout_ms(),
            variable_persist: default_variable_persist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory. Conversations, variables and assets get subdirectories.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    AppConfig::config_dir().join("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    pub fn variables_dir(&self) -> PathBuf {
        self.data_dir.join("variables")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.loomweave/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `LOOMWEAVE_API_KEY` (only when the file sets none)
    /// - `LOOMWEAVE_MODEL`
    /// - `LOOMWEAVE_DATA_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("LOOMWEAVE_API_KEY").ok();
        }

        if let Ok(model) = std::env::var("LOOMWEAVE_MODEL") {
            config.llm.model = model;
        }

        if let Ok(dir) = std::env::var("LOOMWEAVE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".loomweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::ValidationError(
                "llm.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if !matches!(self.pipeline.default_view.as_str(), "user" | "model") {
            return Err(ConfigError::ValidationError(format!(
                "pipeline.default_view must be \"user\" or \"model\", got {:?}",
                self.pipeline.default_view
            )));
        }

        if self.pipeline.scan_depth == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.scan_depth must be at least 1".into(),
            ));
        }

        if self.pipeline.hook_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.hook_timeout_ms must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

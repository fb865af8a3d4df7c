//! Configuration system for Keyward
//!
//! Loads configuration from a TOML file. Every section and key is optional.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use url::Url;

/// Default identity authority endpoint
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api/v1";

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default background role-poll period in seconds
pub const DEFAULT_REVALIDATE_SECS: u64 = 30;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main Keyward configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity authority connection
    pub authority: AuthorityConfig,
    /// Session behaviour
    pub session: SessionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Self::from_raw(raw)
    }

    /// Convert from raw TOML config to validated config
    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            authority: raw.authority.unwrap_or_default().try_into()?,
            session: raw.session.unwrap_or_default().try_into()?,
            logging: raw.logging.unwrap_or_default().try_into()?,
        })
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keyward")
            .join("config.toml")
    }

    /// Render a commented starter file for `keyward init`
    pub fn template() -> String {
        format!(
            r#"# Keyward configuration

[authority]
base_url = "{base_url}"
timeout_secs = {timeout}
user_agent = "{user_agent}"

[session]
revalidate_interval_secs = {revalidate}

[logging]
# trace, debug, info, warn, error (or a full filter directive)
level = "info"
# pretty or json
format = "pretty"
"#,
            base_url = DEFAULT_BASE_URL,
            timeout = DEFAULT_TIMEOUT_SECS,
            user_agent = default_user_agent(),
            revalidate = DEFAULT_REVALIDATE_SECS,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            authority: AuthorityConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub(crate) fn default_user_agent() -> String {
    format!("keyward/{}", env!("CARGO_PKG_VERSION"))
}

/// Identity authority connection settings
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Root of the authority's REST API
    pub base_url: Url,
    /// Per-request timeout
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: default_user_agent(),
        }
    }
}

fn default_base_url() -> Url {
    Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid")
}

/// Session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Period of the background role poll
    pub revalidate_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            revalidate_interval: Duration::from_secs(DEFAULT_REVALIDATE_SECS),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Format: "json" or "pretty"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format
    Json,
}

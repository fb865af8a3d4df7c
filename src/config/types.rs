//! Raw configuration types for TOML parsing

use super::*;
use serde::Deserialize;

/// Raw configuration as parsed from TOML
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub authority: Option<RawAuthorityConfig>,
    pub session: Option<RawSessionConfig>,
    pub logging: Option<RawLoggingConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawAuthorityConfig {
    pub base_url: Option<String>,
    pub timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

impl TryFrom<RawAuthorityConfig> for AuthorityConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAuthorityConfig) -> Result<Self, Self::Error> {
        let base_url = match raw.base_url {
            Some(url) => parse_base_url(&url)?,
            None => default_base_url(),
        };

        let timeout_secs = raw.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "authority.timeout_secs must be greater than zero".into(),
            ));
        }

        let user_agent = raw
            .user_agent
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(default_user_agent);

        Ok(Self {
            base_url,
            timeout: Duration::from_secs(timeout_secs),
            user_agent,
        })
    }
}

/// Parse an authority root URL; only http and https are accepted
pub fn parse_base_url(url: &str) -> Result<Url, ConfigError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| ConfigError::Invalid(format!("authority.base_url '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(ConfigError::Invalid(format!(
            "authority.base_url must use http or https, got '{}'",
            other
        ))),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawSessionConfig {
    pub revalidate_interval_secs: Option<u64>,
}

impl TryFrom<RawSessionConfig> for SessionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSessionConfig) -> Result<Self, Self::Error> {
        let secs = raw
            .revalidate_interval_secs
            .unwrap_or(DEFAULT_REVALIDATE_SECS);
        if secs == 0 {
            return Err(ConfigError::Invalid(
                "session.revalidate_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(Self {
            revalidate_interval: Duration::from_secs(secs),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl TryFrom<RawLoggingConfig> for LoggingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLoggingConfig) -> Result<Self, Self::Error> {
        let format = match raw.format.as_deref() {
            Some("pretty") | None => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown log format: {}",
                    other
                )))
            }
        };

        Ok(Self {
            level: raw.level.unwrap_or_else(|| "info".to_string()),
            format,
        })
    }
}

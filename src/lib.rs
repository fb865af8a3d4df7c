//! Keyward - session, capability and API-key lifecycle for identity authority clients
//!
//! Keyward sits between presentation code and a remote identity authority.
//! It keeps the client's session consistent with what the authority asserts,
//! answers "may the caller do this" from an enumerated capability set, and
//! drives the API-key lifecycle (create, suspend, resume, extend, delete)
//! after checking ownership and role policy locally.

pub mod authority;
pub mod config;
pub mod gate;
pub mod keys;
pub mod session;
pub mod token;
pub mod users;

pub use gate::{Capability, Denial, Gate};
pub use keys::{ApiKey, ApiKeyManager, ApiKeyStatus};
pub use session::{SessionMonitor, SessionState};
pub use users::{User, UserAdmin};

use authority::AuthorityError;
use thiserror::Error;

/// Core error type returned by every consumer-facing operation
#[derive(Error, Debug)]
pub enum KeywardError {
    #[error("Malformed credential: {0}")]
    Decode(#[from] token::DecodeError),

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Forbidden: {0}")]
    Forbidden(Denial),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Network error: {message}")]
    TransientNetwork { message: String, retryable: bool },

    #[error("Session changed while the request was in flight")]
    StaleSession,

    #[error("Identity authority error: {0}")]
    Authority(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl KeywardError {
    /// Whether the failure came from the network rather than from policy or input
    pub fn is_transient(&self) -> bool {
        matches!(self, KeywardError::TransientNetwork { .. })
    }

    /// Whether the same call can be repeated blindly.
    ///
    /// False for a failed `create`: the authority may still have minted the key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeywardError::TransientNetwork {
                retryable: true,
                ..
            }
        )
    }

    /// Mark a network failure of a non-idempotent call as unsafe to repeat
    pub(crate) fn non_idempotent(self) -> Self {
        match self {
            KeywardError::TransientNetwork { message, .. } => KeywardError::TransientNetwork {
                message,
                retryable: false,
            },
            other => other,
        }
    }

    /// The denial reason, if this is a policy refusal
    pub fn denial(&self) -> Option<&Denial> {
        match self {
            KeywardError::Forbidden(denial) => Some(denial),
            _ => None,
        }
    }
}

impl From<AuthorityError> for KeywardError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::Unauthorized => KeywardError::Unauthenticated,
            AuthorityError::Forbidden(message) => KeywardError::Forbidden(Denial::Authority(message)),
            AuthorityError::NotFound(what) => KeywardError::NotFound(what),
            AuthorityError::Conflict(message) => KeywardError::Conflict(message),
            AuthorityError::InvalidArgument(message) => KeywardError::InvalidArgument(message),
            AuthorityError::Network(message) => KeywardError::TransientNetwork {
                message,
                retryable: true,
            },
            other => KeywardError::Authority(other.to_string()),
        }
    }
}

/// Serde helpers for the identity authority's wire formats
///
/// The authority emits integer ids and naive (offset-less) UTC timestamps;
/// both are normalised here so the rest of the crate sees `String` ids and
/// `DateTime<Utc>`.
pub(crate) mod wire {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    impl From<RawId> for String {
        fn from(raw: RawId) -> Self {
            match raw {
                RawId::Int(n) => n.to_string(),
                RawId::Text(s) => s,
            }
        }
    }

    pub fn id<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawId::deserialize(deserializer).map(String::from)
    }

    pub fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
    }

    fn parse_timestamp<E: serde::de::Error>(s: &str) -> Result<DateTime<Utc>, E> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| E::custom(format!("invalid timestamp '{}': {}", s, e)))
    }

    pub fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_timestamp(&s)
    }

    pub fn opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => parse_timestamp(&s).map(Some),
            None => Ok(None),
        }
    }

    pub fn secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(SecretString::from(s))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RoleRef {
        Name(String),
        Object { name: String },
    }

    /// Role lists arrive either as plain names or as `{id, name}` objects
    pub fn role_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let refs = Option::<Vec<RoleRef>>::deserialize(deserializer)?.unwrap_or_default();
        Ok(refs
            .into_iter()
            .map(|r| match r {
                RoleRef::Name(name) | RoleRef::Object { name } => name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "wire::id")]
        id: String,
        #[serde(deserialize_with = "wire::timestamp")]
        at: chrono::DateTime<chrono::Utc>,
        #[serde(default, deserialize_with = "wire::opt_timestamp")]
        maybe: Option<chrono::DateTime<chrono::Utc>>,
        #[serde(default, deserialize_with = "wire::role_names")]
        roles: Vec<String>,
    }

    #[test]
    fn test_wire_accepts_integer_ids_and_naive_timestamps() {
        let probe: Probe = serde_json::from_str(
            r#"{"id": 42, "at": "2024-03-01T10:15:30.123456", "roles": [{"id": 1, "name": "admin"}, "user"]}"#,
        )
        .unwrap();

        assert_eq!(probe.id, "42");
        assert_eq!(probe.at.to_rfc3339(), "2024-03-01T10:15:30.123456+00:00");
        assert!(probe.maybe.is_none());
        assert_eq!(probe.roles, vec!["admin".to_string(), "user".to_string()]);
    }

    #[test]
    fn test_wire_accepts_rfc3339() {
        let probe: Probe = serde_json::from_str(
            r#"{"id": "k-1", "at": "2024-03-01T10:15:30Z", "maybe": "2024-03-08T00:00:00+02:00"}"#,
        )
        .unwrap();

        assert_eq!(probe.id, "k-1");
        assert_eq!(probe.maybe.unwrap().to_rfc3339(), "2024-03-07T22:00:00+00:00");
        assert!(probe.roles.is_empty());
    }

    #[test]
    fn test_authority_errors_keep_their_names() {
        let err: KeywardError = AuthorityError::Forbidden("admin role required".into()).into();
        assert!(matches!(err.denial(), Some(Denial::Authority(_))));

        let err: KeywardError = AuthorityError::Network("timed out".into()).into();
        assert!(err.is_transient());
        assert!(err.is_retryable());

        let err = err.non_idempotent();
        assert!(err.is_transient());
        assert!(!err.is_retryable());

        let err: KeywardError = AuthorityError::Unauthorized.into();
        assert!(matches!(err, KeywardError::Unauthenticated));
    }
}

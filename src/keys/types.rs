//! API key types
//!
//! Provides:
//! - ApiKeyStatus, the key's position in its lifecycle
//! - ApiKey, an advisory copy of the authority's key record (never the secret)
//! - ApiKeySecret and CreatedKey for the one-time disclosure at creation

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    /// Usable
    Active,
    /// Temporarily disabled, can be resumed
    Suspended,
    /// Revoked; no further transition is possible
    Deleted,
}

impl ApiKeyStatus {
    /// Deleted keys accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApiKeyStatus::Deleted)
    }
}

impl std::fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiKeyStatus::Active => write!(f, "active"),
            ApiKeyStatus::Suspended => write!(f, "suspended"),
            ApiKeyStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// API key metadata as reported by the identity authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ApiKeyWire")]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Advisory telemetry from the authority
    pub last_used_at: Option<DateTime<Utc>>,
    pub status: ApiKeyStatus,
}

impl ApiKey {
    /// Check if the key has expired
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() >= expires,
            None => false,
        }
    }

    /// Check whether `subject` owns this key
    pub fn is_owned_by(&self, subject: &str) -> bool {
        self.owner_id == subject
    }
}

/// Wire shape: older authorities send `created_by` and `is_active` instead of
/// `owner_id` and `status`
#[derive(Deserialize)]
struct ApiKeyWire {
    #[serde(deserialize_with = "crate::wire::id")]
    id: String,
    name: String,
    #[serde(alias = "created_by", deserialize_with = "crate::wire::id")]
    owner_id: String,
    #[serde(deserialize_with = "crate::wire::timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "crate::wire::opt_timestamp")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "crate::wire::opt_timestamp")]
    last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    status: Option<ApiKeyStatus>,
    #[serde(default)]
    is_active: Option<bool>,
}

impl From<ApiKeyWire> for ApiKey {
    fn from(wire: ApiKeyWire) -> Self {
        let status = match (wire.status, wire.is_active) {
            (Some(status), _) => status,
            (None, Some(false)) => ApiKeyStatus::Suspended,
            (None, _) => ApiKeyStatus::Active,
        };
        Self {
            id: wire.id,
            name: wire.name,
            owner_id: wire.owner_id,
            created_at: wire.created_at,
            expires_at: wire.expires_at,
            last_used_at: wire.last_used_at,
            status,
        }
    }
}

/// The plaintext key value, disclosed once at creation.
///
/// Not `Clone` and not `Serialize`; `reveal` consumes it.
pub struct ApiKeySecret(SecretString);

impl ApiKeySecret {
    pub(crate) fn new(secret: SecretString) -> Self {
        Self(secret)
    }

    /// Hand the plaintext to the caller for its one-time display
    pub fn reveal(self) -> String {
        self.0.expose_secret().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for ApiKeySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKeySecret([REDACTED])")
    }
}

/// Result of a successful create: metadata plus the one-time secret
#[derive(Debug)]
pub struct CreatedKey {
    pub key: ApiKey,
    pub secret: ApiKeySecret,
}

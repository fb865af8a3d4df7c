//! Request and response envelopes for the identity authority

use crate::keys::{ApiKey, ApiKeyStatus};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// `POST /token` response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(deserialize_with = "crate::wire::secret")]
    pub access_token: SecretString,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// `GET /users/me/roles` response
#[derive(Debug, Deserialize)]
pub struct RolesResponse {
    #[serde(default, deserialize_with = "crate::wire::role_names")]
    pub roles: Vec<String>,
}

/// `POST /api-keys` body
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CreateApiKeyRequest {
    pub name: String,
    /// `None` means the key never expires
    pub expires_in_days: Option<i64>,
}

/// `PUT /api-keys/{id}/extend` body
#[derive(Debug, Serialize)]
pub struct ExtendApiKeyRequest {
    pub days: i64,
}

/// `POST /api-keys` response, the only payload that carries the secret
#[derive(Debug, Deserialize)]
pub struct CreatedApiKeyRecord {
    #[serde(deserialize_with = "crate::wire::id")]
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "crate::wire::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "crate::wire::opt_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "crate::wire::secret")]
    pub api_key: SecretString,
    #[serde(default, alias = "created_by", deserialize_with = "crate::wire::opt_id")]
    pub owner_id: Option<String>,
}

impl CreatedApiKeyRecord {
    /// Split into metadata and secret. The creator owns the key unless the
    /// authority says otherwise.
    pub(crate) fn into_parts(self, creator: &str) -> (ApiKey, SecretString) {
        let key = ApiKey {
            id: self.id,
            name: self.name,
            owner_id: self.owner_id.unwrap_or_else(|| creator.to_string()),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_used_at: None,
            status: ApiKeyStatus::Active,
        };
        (key, self.api_key)
    }
}

/// `PUT /users/{id}/status` body
#[derive(Debug, Serialize)]
pub struct UserStatusRequest {
    pub is_active: bool,
}

/// `PUT /users/{id}/roles` body
#[derive(Debug, Serialize)]
pub struct UserRolesRequest {
    pub roles: Vec<String>,
}

/// FastAPI-style error body
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub detail: serde_json::Value,
}

impl ErrorBody {
    pub(crate) fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_created_record_debug_hides_secret() {
        let record: CreatedApiKeyRecord = serde_json::from_str(
            r#"{"id": 9, "name": "ci", "created_at": "2024-01-01T00:00:00",
                "expires_at": null, "api_key": "kw_topsecret"}"#,
        )
        .unwrap();

        assert!(!format!("{:?}", record).contains("kw_topsecret"));

        let (key, secret) = record.into_parts("3");
        assert_eq!(key.owner_id, "3");
        assert_eq!(key.status, ApiKeyStatus::Active);
        assert_eq!(secret.expose_secret(), "kw_topsecret");
    }

    #[test]
    fn test_create_request_sends_null_for_no_expiry() {
        let body = serde_json::to_value(CreateApiKeyRequest {
            name: "n".into(),
            expires_in_days: None,
        })
        .unwrap();
        assert!(body["expires_in_days"].is_null());
    }

    #[test]
    fn test_error_body_message() {
        let body: ErrorBody = serde_json::from_str(r#"{"detail": "Not authenticated"}"#).unwrap();
        assert_eq!(body.message(), "Not authenticated");

        let body: ErrorBody =
            serde_json::from_str(r#"{"detail": [{"loc": ["body", "days"], "msg": "required"}]}"#)
                .unwrap();
        assert!(body.message().contains("required"));
    }
}

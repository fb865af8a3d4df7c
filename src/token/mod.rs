//! Bearer token decoding
//!
//! Extracts the self-asserted claims (subject, roles, expiry) from an access
//! token issued by the identity authority. Tokens use the compact JWT layout:
//! three base64url segments separated by dots.
//!
//! No signature verification happens here. Decoded claims drive what a
//! consumer renders; the authority re-checks every request it receives.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Classification of decode failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The token is empty, truncated, or does not parse
    Malformed,
}

/// Token decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token is empty")]
    Empty,

    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),

    #[error("{segment} segment is not valid base64url")]
    Encoding { segment: &'static str },

    #[error("{segment} segment is not valid JSON: {reason}")]
    Json { segment: &'static str, reason: String },

    #[error("invalid claim '{0}'")]
    InvalidClaim(&'static str),
}

impl DecodeError {
    /// Every decode failure is a malformed credential
    pub fn kind(&self) -> DecodeErrorKind {
        DecodeErrorKind::Malformed
    }
}

/// Claims extracted from an access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Identity used for ownership checks (the user id when the token carries one)
    pub subject: String,
    /// Login name from the `sub` claim
    pub username: String,
    /// Self-asserted role names
    pub roles: HashSet<String>,
    /// Expiry from the `exp` claim
    pub expires_at: DateTime<Utc>,
}

impl Claims {
    /// Check expiry against an explicit instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check expiry against the current time
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(
        default,
        deserialize_with = "crate::wire::opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    uid: Option<String>,
}

fn decode_segment(segment: &str, name: &'static str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|_| DecodeError::Encoding { segment: name })
}

/// Decode a bearer token into its claims
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(DecodeError::Empty);
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(DecodeError::SegmentCount(parts.len()));
    }

    // The header only has to be a JSON object; its algorithm is irrelevant here
    let header = decode_segment(parts[0], "header")?;
    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&header).map_err(|e| {
        DecodeError::Json {
            segment: "header",
            reason: e.to_string(),
        }
    })?;

    let payload = decode_segment(parts[1], "payload")?;
    let raw: RawClaims = serde_json::from_slice(&payload).map_err(|e| DecodeError::Json {
        segment: "payload",
        reason: e.to_string(),
    })?;

    let username = raw
        .sub
        .filter(|s| !s.trim().is_empty())
        .ok_or(DecodeError::InvalidClaim("sub"))?;
    let expires_at = raw
        .exp
        .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
        .ok_or(DecodeError::InvalidClaim("exp"))?;

    Ok(Claims {
        subject: raw.uid.unwrap_or_else(|| username.clone()),
        username,
        roles: raw.roles.into_iter().collect(),
        expires_at,
    })
}

/// Encode claims as an unsigned token in the same layout `decode` reads.
///
/// Used by in-process authorities and tests. The signature segment is empty.
pub fn encode_unsigned(claims: &Claims) -> String {
    let header = serde_json::json!({ "alg": "none", "typ": "JWT" });
    let mut roles: Vec<String> = claims.roles.iter().cloned().collect();
    roles.sort();

    let raw = RawClaims {
        sub: Some(claims.username.clone()),
        exp: Some(claims.expires_at.timestamp()),
        roles,
        uid: (claims.subject != claims.username).then(|| claims.subject.clone()),
    };

    format!(
        "{}.{}.",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&raw).unwrap_or_default())
    )
}

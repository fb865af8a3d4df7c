//! Identity authority seam
//!
//! The authority owns users, credentials and API keys. This crate only talks
//! to it through [`IdentityAuthority`]; [`HttpAuthority`] speaks the REST
//! protocol and [`MemoryAuthority`] keeps everything in process.

mod http;
mod memory;
mod types;

pub use http::HttpAuthority;
pub use memory::MemoryAuthority;
pub use types::{
    CreateApiKeyRequest, CreatedApiKeyRecord, ExtendApiKeyRequest, RolesResponse, TokenResponse,
    UserRolesRequest, UserStatusRequest,
};

use crate::keys::ApiKey;
use crate::users::{NewUser, User};
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashSet;
use thiserror::Error;

/// Errors reported by an identity authority
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("Authority rejected the credentials")]
    Unauthorized,

    #[error("Authority refused the request: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Authority unreachable: {0}")]
    Network(String),

    #[error("Authority returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response from authority: {0}")]
    InvalidResponse(String),
}

/// Result type for authority calls
pub type AuthorityResult<T> = Result<T, AuthorityError>;

/// Remote source of truth for identity, roles and API keys
///
/// Every call except `exchange_credentials` carries the caller's bearer token;
/// the authority re-checks it and its own policy on each request.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    // ==================== Session ====================

    /// Exchange a username and password for an access token
    async fn exchange_credentials(
        &self,
        username: &str,
        password: &SecretString,
    ) -> AuthorityResult<SecretString>;

    /// Invalidate a token server-side
    async fn logout(&self, token: &SecretString) -> AuthorityResult<()>;

    /// Authoritative role set of the token's user
    async fn current_roles(&self, token: &SecretString) -> AuthorityResult<HashSet<String>>;

    // ==================== API Keys ====================

    /// Create a key; the response is the only place its secret appears
    async fn create_api_key(
        &self,
        token: &SecretString,
        request: &CreateApiKeyRequest,
    ) -> AuthorityResult<CreatedApiKeyRecord>;

    /// Keys visible to the caller
    async fn list_api_keys(&self, token: &SecretString) -> AuthorityResult<Vec<ApiKey>>;

    /// Fetch one key by id
    async fn get_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<ApiKey>;

    async fn suspend_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()>;

    async fn resume_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()>;

    /// Push the key's expiry out by `days`
    async fn extend_api_key(&self, token: &SecretString, id: &str, days: i64)
        -> AuthorityResult<()>;

    async fn delete_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()>;

    // ==================== Users ====================

    async fn list_users(&self, token: &SecretString) -> AuthorityResult<Vec<User>>;

    async fn create_user(&self, token: &SecretString, user: &NewUser) -> AuthorityResult<User>;

    async fn set_user_status(
        &self,
        token: &SecretString,
        user_id: &str,
        is_active: bool,
    ) -> AuthorityResult<()>;

    async fn set_user_roles(
        &self,
        token: &SecretString,
        user_id: &str,
        roles: &HashSet<String>,
    ) -> AuthorityResult<()>;

    async fn reset_password(
        &self,
        token: &SecretString,
        user_id: &str,
        new_password: &SecretString,
    ) -> AuthorityResult<()>;

    async fn delete_user(&self, token: &SecretString, user_id: &str) -> AuthorityResult<()>;
}

//! In-process identity authority
//!
//! Keeps users, sessions and API keys in memory and enforces the same
//! server-side checks as the REST authority: bearer validation, ownership or
//! admin for key mutations, admin for user management. It does not enforce
//! the last-admin invariant; that is the gate's job.

use super::types::{CreateApiKeyRequest, CreatedApiKeyRecord};
use super::{AuthorityError, AuthorityResult, IdentityAuthority};
use crate::gate::ROLE_ADMIN;
use crate::keys::{ApiKey, ApiKeyStatus};
use crate::token::{self, Claims};
use crate::users::{NewUser, User};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use subtle::ConstantTimeEq;
use tracing::debug;

/// API key prefix
const KEY_PREFIX: &str = "kw_";

/// Length of the random part of the key
const KEY_RANDOM_LENGTH: usize = 32;

/// Default lifetime of issued access tokens
const DEFAULT_TOKEN_TTL_MINUTES: i64 = 30;

struct StoredUser {
    user: User,
    password: SecretString,
}

struct StoredKey {
    key: ApiKey,
    secret_hash: String,
}

#[derive(Default)]
struct State {
    users: HashMap<String, StoredUser>,
    keys: HashMap<String, StoredKey>,
    /// Issued token -> user id
    sessions: HashMap<String, String>,
}

/// Identity authority backed by process memory
pub struct MemoryAuthority {
    state: RwLock<State>,
    token_ttl: Duration,
    offline: AtomicBool,
    latency: Mutex<std::time::Duration>,
    requests: AtomicU64,
}

impl MemoryAuthority {
    /// Create an empty authority issuing 30-minute tokens
    pub fn new() -> Self {
        Self::with_token_ttl(Duration::minutes(DEFAULT_TOKEN_TTL_MINUTES))
    }

    /// Create an empty authority issuing tokens with a custom lifetime
    pub fn with_token_ttl(token_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(State::default()),
            token_ttl,
            offline: AtomicBool::new(false),
            latency: Mutex::new(std::time::Duration::ZERO),
            requests: AtomicU64::new(0),
        }
    }

    // ==================== Test controls ====================

    /// Register a user directly, bypassing the admin check. Returns the id.
    pub fn add_user(&self, username: &str, password: &str, roles: &[&str]) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let user = User {
            id: id.clone(),
            username: username.to_string(),
            email: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            is_active: true,
            created_at: Some(Utc::now()),
        };
        self.state.write().users.insert(
            id.clone(),
            StoredUser {
                user,
                password: SecretString::from(password.to_string()),
            },
        );
        id
    }

    /// Mint a token for `username` with an explicit lifetime, bypassing the
    /// password exchange. A negative lifetime yields an already expired token.
    pub fn issue_token(&self, username: &str, ttl: Duration) -> Option<String> {
        let mut state = self.state.write();
        let user = state
            .users
            .values()
            .find(|stored| stored.user.username == username)
            .map(|stored| stored.user.clone())?;
        Some(Self::mint(&mut state, &user, ttl))
    }

    /// Simulate the authority becoming unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every response by `latency`
    pub fn set_latency(&self, latency: std::time::Duration) {
        *self.latency.lock() = latency;
    }

    /// Replace a user's roles server-side, as an out-of-band admin would
    pub fn replace_roles(&self, user_id: &str, roles: &[&str]) {
        if let Some(stored) = self.state.write().users.get_mut(user_id) {
            stored.user.roles = roles.iter().map(|r| r.to_string()).collect();
        }
    }

    /// Current server-side view of a user
    pub fn user(&self, user_id: &str) -> Option<User> {
        self.state.read().users.get(user_id).map(|s| s.user.clone())
    }

    /// Current server-side status of a key, including deleted keys
    pub fn key_status(&self, key_id: &str) -> Option<ApiKeyStatus> {
        self.state.read().keys.get(key_id).map(|s| s.key.status)
    }

    /// Number of keys ever created, deleted ones included
    pub fn key_count(&self) -> usize {
        self.state.read().keys.len()
    }

    /// Number of requests that reached the authority
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Whether a token is still accepted
    pub fn is_token_live(&self, token: &str) -> bool {
        self.state.read().sessions.contains_key(token)
    }

    /// Check a presented API key the way a resource server would, recording
    /// its use
    pub fn verify_api_key(&self, secret: &str) -> Option<ApiKey> {
        let hash = hash_key(secret);
        let mut state = self.state.write();
        let stored = state
            .keys
            .values_mut()
            .find(|stored| bool::from(stored.secret_hash.as_bytes().ct_eq(hash.as_bytes())))?;
        if stored.key.status != ApiKeyStatus::Active || stored.key.is_expired() {
            return None;
        }
        stored.key.last_used_at = Some(Utc::now());
        Some(stored.key.clone())
    }

    // ==================== Internals ====================

    fn mint(state: &mut State, user: &User, ttl: Duration) -> String {
        let claims = Claims {
            subject: user.id.clone(),
            username: user.username.clone(),
            roles: user.roles.clone(),
            expires_at: Utc::now() + ttl,
        };
        let token = token::encode_unsigned(&claims);
        state.sessions.insert(token.clone(), user.id.clone());
        token
    }

    /// Count the request, apply latency, and fail if offline
    async fn enter(&self) -> AuthorityResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(AuthorityError::Network("authority unreachable".into()));
        }
        Ok(())
    }

    /// Resolve a bearer token to an active, unexpired user
    fn caller(state: &State, token: &SecretString) -> AuthorityResult<User> {
        let token = token.expose_secret();
        let user_id = state
            .sessions
            .get(token)
            .ok_or(AuthorityError::Unauthorized)?;
        let claims = token::decode(token).map_err(|_| AuthorityError::Unauthorized)?;
        if claims.is_expired() {
            return Err(AuthorityError::Unauthorized);
        }
        let stored = state
            .users
            .get(user_id)
            .ok_or(AuthorityError::Unauthorized)?;
        if !stored.user.is_active {
            return Err(AuthorityError::Unauthorized);
        }
        Ok(stored.user.clone())
    }

    fn require_admin(user: &User) -> AuthorityResult<()> {
        if user.roles.contains(ROLE_ADMIN) {
            Ok(())
        } else {
            Err(AuthorityError::Forbidden("Admin role required".into()))
        }
    }

    /// Look up a live key the caller may mutate
    fn owned_key<'a>(
        state: &'a mut State,
        caller: &User,
        id: &str,
    ) -> AuthorityResult<&'a mut StoredKey> {
        let stored = state
            .keys
            .get_mut(id)
            .ok_or_else(|| AuthorityError::NotFound(format!("API key {}", id)))?;
        if stored.key.owner_id != caller.id && !caller.roles.contains(ROLE_ADMIN) {
            return Err(AuthorityError::Forbidden(
                "Not allowed to manage this API key".into(),
            ));
        }
        if stored.key.status.is_terminal() {
            return Err(AuthorityError::Conflict(format!("API key {} is deleted", id)));
        }
        Ok(stored)
    }

    fn user_mut<'a>(state: &'a mut State, id: &str) -> AuthorityResult<&'a mut StoredUser> {
        state
            .users
            .get_mut(id)
            .ok_or_else(|| AuthorityError::NotFound(format!("User {}", id)))
    }
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a new API key secret
fn generate_key() -> String {
    let mut random_bytes = [0u8; KEY_RANDOM_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut random_bytes);

    let random_part: String = STANDARD
        .encode(random_bytes)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(KEY_RANDOM_LENGTH)
        .collect();

    format!("{}{}", KEY_PREFIX, random_part)
}

/// Hash an API key secret
fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn add_days(base: DateTime<Utc>, days: i64) -> AuthorityResult<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|delta| base.checked_add_signed(delta))
        .ok_or_else(|| AuthorityError::InvalidArgument(format!("{} days is out of range", days)))
}

#[async_trait]
impl IdentityAuthority for MemoryAuthority {
    async fn exchange_credentials(
        &self,
        username: &str,
        password: &SecretString,
    ) -> AuthorityResult<SecretString> {
        self.enter().await?;
        let mut state = self.state.write();
        let user = state
            .users
            .values()
            .find(|stored| {
                stored.user.username == username
                    && bool::from(
                        stored
                            .password
                            .expose_secret()
                            .as_bytes()
                            .ct_eq(password.expose_secret().as_bytes()),
                    )
            })
            .map(|stored| stored.user.clone())
            .ok_or(AuthorityError::Unauthorized)?;
        if !user.is_active {
            return Err(AuthorityError::Unauthorized);
        }
        debug!(user_id = %user.id, "Issued access token");
        Ok(SecretString::from(Self::mint(&mut state, &user, self.token_ttl)))
    }

    async fn logout(&self, token: &SecretString) -> AuthorityResult<()> {
        self.enter().await?;
        self.state.write().sessions.remove(token.expose_secret());
        Ok(())
    }

    async fn current_roles(&self, token: &SecretString) -> AuthorityResult<HashSet<String>> {
        self.enter().await?;
        let state = self.state.read();
        Ok(Self::caller(&state, token)?.roles)
    }

    async fn create_api_key(
        &self,
        token: &SecretString,
        request: &CreateApiKeyRequest,
    ) -> AuthorityResult<CreatedApiKeyRecord> {
        self.enter().await?;
        let mut state = self.state.write();
        let caller = Self::caller(&state, token)?;

        let name = request.name.trim();
        if name.is_empty() {
            return Err(AuthorityError::InvalidArgument("name is required".into()));
        }

        let now = Utc::now();
        let expires_at = match request.expires_in_days.filter(|days| *days > 0) {
            Some(days) => Some(add_days(now, days)?),
            None => None,
        };

        let secret = generate_key();
        let key = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_id: caller.id.clone(),
            created_at: now,
            expires_at,
            last_used_at: None,
            status: ApiKeyStatus::Active,
        };

        let record = CreatedApiKeyRecord {
            id: key.id.clone(),
            name: key.name.clone(),
            created_at: key.created_at,
            expires_at: key.expires_at,
            api_key: SecretString::from(secret.clone()),
            owner_id: Some(key.owner_id.clone()),
        };
        state.keys.insert(
            key.id.clone(),
            StoredKey {
                key,
                secret_hash: hash_key(&secret),
            },
        );
        Ok(record)
    }

    async fn list_api_keys(&self, token: &SecretString) -> AuthorityResult<Vec<ApiKey>> {
        self.enter().await?;
        let state = self.state.read();
        let caller = Self::caller(&state, token)?;
        let is_admin = caller.roles.contains(ROLE_ADMIN);

        let mut keys: Vec<ApiKey> = state
            .keys
            .values()
            .map(|stored| &stored.key)
            .filter(|key| key.status != ApiKeyStatus::Deleted)
            .filter(|key| is_admin || key.owner_id == caller.id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    async fn get_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<ApiKey> {
        self.enter().await?;
        let state = self.state.read();
        Self::caller(&state, token)?;
        state
            .keys
            .get(id)
            .map(|stored| stored.key.clone())
            .ok_or_else(|| AuthorityError::NotFound(format!("API key {}", id)))
    }

    async fn suspend_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        let caller = Self::caller(&state, token)?;
        Self::owned_key(&mut state, &caller, id)?.key.status = ApiKeyStatus::Suspended;
        Ok(())
    }

    async fn resume_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        let caller = Self::caller(&state, token)?;
        Self::owned_key(&mut state, &caller, id)?.key.status = ApiKeyStatus::Active;
        Ok(())
    }

    async fn extend_api_key(
        &self,
        token: &SecretString,
        id: &str,
        days: i64,
    ) -> AuthorityResult<()> {
        self.enter().await?;
        if days <= 0 {
            return Err(AuthorityError::InvalidArgument(
                "days must be positive".into(),
            ));
        }
        let mut state = self.state.write();
        let caller = Self::caller(&state, token)?;
        let stored = Self::owned_key(&mut state, &caller, id)?;
        let base = stored.key.expires_at.unwrap_or_else(Utc::now);
        stored.key.expires_at = Some(add_days(base, days)?);
        Ok(())
    }

    async fn delete_api_key(&self, token: &SecretString, id: &str) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        let caller = Self::caller(&state, token)?;
        Self::owned_key(&mut state, &caller, id)?.key.status = ApiKeyStatus::Deleted;
        Ok(())
    }

    async fn list_users(&self, token: &SecretString) -> AuthorityResult<Vec<User>> {
        self.enter().await?;
        let state = self.state.read();
        Self::require_admin(&Self::caller(&state, token)?)?;
        let mut users: Vec<User> = state.users.values().map(|s| s.user.clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn create_user(&self, token: &SecretString, new_user: &NewUser) -> AuthorityResult<User> {
        self.enter().await?;
        let mut state = self.state.write();
        Self::require_admin(&Self::caller(&state, token)?)?;

        if state
            .users
            .values()
            .any(|stored| stored.user.username == new_user.username)
        {
            return Err(AuthorityError::Conflict(format!(
                "Username '{}' already registered",
                new_user.username
            )));
        }

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: new_user.username.clone(),
            email: Some(new_user.email.clone()),
            roles: new_user.roles.clone(),
            is_active: new_user.is_active,
            created_at: Some(Utc::now()),
        };
        state.users.insert(
            user.id.clone(),
            StoredUser {
                user: user.clone(),
                password: SecretString::from(new_user.password.expose_secret()),
            },
        );
        Ok(user)
    }

    async fn set_user_status(
        &self,
        token: &SecretString,
        user_id: &str,
        is_active: bool,
    ) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        Self::require_admin(&Self::caller(&state, token)?)?;
        Self::user_mut(&mut state, user_id)?.user.is_active = is_active;
        Ok(())
    }

    async fn set_user_roles(
        &self,
        token: &SecretString,
        user_id: &str,
        roles: &HashSet<String>,
    ) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        Self::require_admin(&Self::caller(&state, token)?)?;
        Self::user_mut(&mut state, user_id)?.user.roles = roles.clone();
        Ok(())
    }

    async fn reset_password(
        &self,
        token: &SecretString,
        user_id: &str,
        new_password: &SecretString,
    ) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        Self::require_admin(&Self::caller(&state, token)?)?;
        Self::user_mut(&mut state, user_id)?.password =
            SecretString::from(new_password.expose_secret());
        Ok(())
    }

    async fn delete_user(&self, token: &SecretString, user_id: &str) -> AuthorityResult<()> {
        self.enter().await?;
        let mut state = self.state.write();
        Self::require_admin(&Self::caller(&state, token)?)?;
        state
            .users
            .remove(user_id)
            .ok_or_else(|| AuthorityError::NotFound(format!("User {}", user_id)))?;
        state.sessions.retain(|_, owner| owner != user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_generate_key_format() {
        let key = generate_key();
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(key.len(), KEY_PREFIX.len() + KEY_RANDOM_LENGTH);
        assert_ne!(key, generate_key());
    }

    #[tokio::test]
    async fn test_login_and_roles() {
        let authority = MemoryAuthority::new();
        let id = authority.add_user("alice", "pw", &["user"]);

        let token = authority
            .exchange_credentials("alice", &secret("pw"))
            .await
            .unwrap();
        let claims = token::decode(token.expose_secret()).unwrap();
        assert_eq!(claims.subject, id);
        assert_eq!(claims.username, "alice");

        let roles = authority.current_roles(&token).await.unwrap();
        assert!(roles.contains("user"));

        assert_eq!(
            authority
                .exchange_credentials("alice", &secret("wrong"))
                .await
                .unwrap_err(),
            AuthorityError::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_logout_invalidates_token() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &[]);
        let token = authority
            .exchange_credentials("alice", &secret("pw"))
            .await
            .unwrap();

        authority.logout(&token).await.unwrap();
        assert_eq!(
            authority.current_roles(&token).await.unwrap_err(),
            AuthorityError::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_server_side_ownership() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &["user"]);
        authority.add_user("bob", "pw", &["user"]);
        let alice = secret(&authority.issue_token("alice", Duration::minutes(5)).unwrap());
        let bob = secret(&authority.issue_token("bob", Duration::minutes(5)).unwrap());

        let created = authority
            .create_api_key(
                &alice,
                &CreateApiKeyRequest {
                    name: "ci".into(),
                    expires_in_days: Some(1),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            authority.suspend_api_key(&bob, &created.id).await,
            Err(AuthorityError::Forbidden(_))
        ));
        assert!(authority.list_api_keys(&bob).await.unwrap().is_empty());
        assert_eq!(authority.list_api_keys(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verify_api_key_records_use() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &[]);
        let token = secret(&authority.issue_token("alice", Duration::minutes(5)).unwrap());
        let created = authority
            .create_api_key(
                &token,
                &CreateApiKeyRequest {
                    name: "ci".into(),
                    expires_in_days: None,
                },
            )
            .await
            .unwrap();

        let plaintext = created.api_key.expose_secret().to_string();
        let used = authority.verify_api_key(&plaintext).unwrap();
        assert!(used.last_used_at.is_some());
        assert!(authority.verify_api_key("kw_unknown").is_none());

        authority.suspend_api_key(&token, &created.id).await.unwrap();
        assert!(authority.verify_api_key(&plaintext).is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_days_rejected() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &[]);
        let token = secret(&authority.issue_token("alice", Duration::minutes(5)).unwrap());

        let err = authority
            .create_api_key(
                &token,
                &CreateApiKeyRequest {
                    name: "ci".into(),
                    expires_in_days: Some(i64::MAX),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::InvalidArgument(_)));
        assert_eq!(authority.key_count(), 0);

        let created = authority
            .create_api_key(
                &token,
                &CreateApiKeyRequest {
                    name: "ci".into(),
                    expires_in_days: Some(30),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            authority.extend_api_key(&token, &created.id, i64::MAX).await,
            Err(AuthorityError::InvalidArgument(_))
        ));
        let key = authority.get_api_key(&token, &created.id).await.unwrap();
        assert_eq!(key.expires_at, created.expires_at);
    }

    #[tokio::test]
    async fn test_offline_reports_network_error() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &[]);
        authority.set_offline(true);

        assert!(matches!(
            authority.exchange_credentials("alice", &secret("pw")).await,
            Err(AuthorityError::Network(_))
        ));
        assert_eq!(authority.request_count(), 1);
    }

    #[tokio::test]
    async fn test_user_management_requires_admin() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &["user"]);
        let token = secret(&authority.issue_token("alice", Duration::minutes(5)).unwrap());

        assert!(matches!(
            authority.list_users(&token).await,
            Err(AuthorityError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let authority = MemoryAuthority::new();
        authority.add_user("alice", "pw", &[]);
        let token = secret(&authority.issue_token("alice", Duration::minutes(-1)).unwrap());

        assert_eq!(
            authority.current_roles(&token).await.unwrap_err(),
            AuthorityError::Unauthorized
        );
    }
}

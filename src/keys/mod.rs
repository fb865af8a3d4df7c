//! API key lifecycle
//!
//! Every operation authorizes through the gate (which revalidates the
//! session), checks ownership-or-admin against the authority's current record,
//! dispatches, and then discards the result if the session changed identity
//! while the call was in flight.

mod types;

pub use types::{ApiKey, ApiKeySecret, ApiKeyStatus, CreatedKey};

use crate::authority::{AuthorityError, CreateApiKeyRequest};
use crate::gate::{Capability, Gate};
use crate::session::ActiveSession;
use crate::KeywardError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Longest accepted key name, in characters
pub const MAX_KEY_NAME_LEN: usize = 100;

/// Largest lifetime or extension, in days, a key may be given
pub const MAX_KEY_DAYS: i64 = 36_500;

/// Result of a delete request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The key moved to Deleted
    Deleted,
    /// The key was already Deleted; nothing changed
    AlreadyDeleted,
}

/// Drives API key transitions on behalf of the session's user
pub struct ApiKeyManager {
    gate: Arc<Gate>,
    tombstones: Mutex<Tombstones>,
}

/// Keys this manager deleted during the current session generation, mapped
/// to their owner. The authority may stop reporting them.
#[derive(Default)]
struct Tombstones {
    generation: u64,
    owners: HashMap<String, String>,
}

impl Tombstones {
    /// Forget everything recorded under an earlier session
    fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            self.generation = generation;
            self.owners.clear();
        }
    }

    fn owner(&mut self, generation: u64, id: &str) -> Option<String> {
        self.sync(generation);
        self.owners.get(id).cloned()
    }

    fn insert(&mut self, generation: u64, id: &str, owner_id: &str) {
        self.sync(generation);
        self.owners.insert(id.to_string(), owner_id.to_string());
    }
}

impl ApiKeyManager {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self {
            gate,
            tombstones: Mutex::new(Tombstones::default()),
        }
    }

    /// Create a key for the session's user.
    ///
    /// `expires_in_days` of `None` or a non-positive count means no expiry;
    /// more than [`MAX_KEY_DAYS`] is rejected.
    /// The secret in the result is the only copy this crate ever hands out.
    pub async fn create(
        &self,
        name: &str,
        expires_in_days: Option<i64>,
    ) -> Result<CreatedKey, KeywardError> {
        let name = validate_name(name)?;
        if let Some(days) = expires_in_days {
            validate_days_limit(days)?;
        }
        let session = self.gate.authorize(Capability::ManageOwnApiKey).await?;

        let request = CreateApiKeyRequest {
            name,
            expires_in_days: expires_in_days.filter(|days| *days > 0),
        };
        let record = self
            .gate
            .authority()
            .create_api_key(&session.token, &request)
            .await
            .map_err(|err| self.absorb(&session, err).non_idempotent())?;

        if let Err(err) = self.gate.monitor().ensure_current(&session) {
            warn!(key_id = %record.id, "Discarding created key: session changed in flight");
            return Err(err);
        }

        let (key, secret) = record.into_parts(session.subject());
        let secret = ApiKeySecret::new(secret);
        if secret.is_empty() {
            return Err(KeywardError::Authority(
                "authority returned an empty key secret".into(),
            ));
        }

        info!(
            key_id = %key.id,
            name = %key.name,
            owner_id = %key.owner_id,
            expires_at = ?key.expires_at,
            "API key created"
        );
        Ok(CreatedKey { key, secret })
    }

    /// Keys the caller may manage: its own, or every key for an admin
    pub async fn list(&self) -> Result<Vec<ApiKey>, KeywardError> {
        let session = self.gate.authorize(Capability::ManageOwnApiKey).await?;
        let keys = self
            .gate
            .authority()
            .list_api_keys(&session.token)
            .await
            .map_err(|err| self.absorb(&session, err))?;
        self.gate.monitor().ensure_current(&session)?;

        let see_all = Capability::ManageAnyApiKey.granted_by(session.roles());
        let mut tombstones = self.tombstones.lock();
        tombstones.sync(session.generation());
        Ok(keys
            .into_iter()
            .filter(|key| key.status != ApiKeyStatus::Deleted)
            .filter(|key| !tombstones.owners.contains_key(&key.id))
            .filter(|key| see_all || key.is_owned_by(session.subject()))
            .collect())
    }

    /// Fetch one key the caller may manage
    pub async fn get(&self, id: &str) -> Result<ApiKey, KeywardError> {
        let id = validate_id(id)?;
        let (_, key) = self.fetch_owned(id).await?;
        Ok(key)
    }

    /// Suspend a key. Suspending a suspended key changes nothing.
    pub async fn suspend(&self, id: &str) -> Result<ApiKey, KeywardError> {
        let id = validate_id(id)?;
        let (session, mut key) = self.fetch_owned(id).await?;
        match key.status {
            ApiKeyStatus::Deleted => return Err(deleted_conflict(id, "suspend")),
            ApiKeyStatus::Suspended => return Ok(key),
            ApiKeyStatus::Active => {}
        }

        self.gate
            .authority()
            .suspend_api_key(&session.token, id)
            .await
            .map_err(|err| self.absorb(&session, err))?;
        self.gate.monitor().ensure_current(&session)?;

        info!(key_id = id, subject = session.subject(), "API key suspended");
        key.status = ApiKeyStatus::Suspended;
        Ok(key)
    }

    /// Resume a suspended key. Resuming an active key changes nothing.
    pub async fn resume(&self, id: &str) -> Result<ApiKey, KeywardError> {
        let id = validate_id(id)?;
        let (session, mut key) = self.fetch_owned(id).await?;
        match key.status {
            ApiKeyStatus::Deleted => return Err(deleted_conflict(id, "resume")),
            ApiKeyStatus::Active => return Ok(key),
            ApiKeyStatus::Suspended => {}
        }

        self.gate
            .authority()
            .resume_api_key(&session.token, id)
            .await
            .map_err(|err| self.absorb(&session, err))?;
        self.gate.monitor().ensure_current(&session)?;

        info!(key_id = id, subject = session.subject(), "API key resumed");
        key.status = ApiKeyStatus::Active;
        Ok(key)
    }

    /// Push a key's expiry out by `days`, counting from now if it had none
    pub async fn extend(&self, id: &str, days: i64) -> Result<ApiKey, KeywardError> {
        let id = validate_id(id)?;
        if days <= 0 {
            return Err(KeywardError::InvalidArgument(format!(
                "days must be positive, got {}",
                days
            )));
        }
        validate_days_limit(days)?;

        let (session, key) = self.fetch_owned(id).await?;
        if key.status.is_terminal() {
            return Err(deleted_conflict(id, "extend"));
        }

        let authority = self.gate.authority();
        authority
            .extend_api_key(&session.token, id, days)
            .await
            .map_err(|err| self.absorb(&session, err))?;
        let updated = authority
            .get_api_key(&session.token, id)
            .await
            .map_err(|err| self.absorb(&session, err))?;
        self.gate.monitor().ensure_current(&session)?;

        info!(
            key_id = id,
            days,
            expires_at = ?updated.expires_at,
            "API key extended"
        );
        Ok(updated)
    }

    /// Delete a key. Deleting an already deleted key is a no-op success.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome, KeywardError> {
        let id = validate_id(id)?;
        let session = self.gate.authorize(Capability::ManageOwnApiKey).await?;
        let tombstone = self.tombstones.lock().owner(session.generation(), id);
        if let Some(owner_id) = tombstone {
            self.gate
                .require_owner(&session, Capability::ManageOwnApiKey, id, &owner_id)?;
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        let key = self.fetch_key(&session, id).await?;
        self.gate
            .require_owner(&session, Capability::ManageOwnApiKey, id, &key.owner_id)?;
        if key.status.is_terminal() {
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        self.gate
            .authority()
            .delete_api_key(&session.token, id)
            .await
            .map_err(|err| self.absorb(&session, err))?;
        self.tombstones
            .lock()
            .insert(session.generation(), id, &key.owner_id);
        self.gate.monitor().ensure_current(&session)?;

        info!(key_id = id, subject = session.subject(), "API key deleted");
        Ok(DeleteOutcome::Deleted)
    }

    /// Authorize, fetch the authority's record and check ownership
    async fn fetch_owned(&self, id: &str) -> Result<(ActiveSession, ApiKey), KeywardError> {
        let session = self.gate.authorize(Capability::ManageOwnApiKey).await?;
        let tombstone = self.tombstones.lock().owner(session.generation(), id);
        if let Some(owner_id) = tombstone {
            self.gate
                .require_owner(&session, Capability::ManageOwnApiKey, id, &owner_id)?;
            return Err(deleted_conflict(id, "modify"));
        }
        let key = self.fetch_key(&session, id).await?;
        self.gate
            .require_owner(&session, Capability::ManageOwnApiKey, id, &key.owner_id)?;
        Ok((session, key))
    }

    async fn fetch_key(&self, session: &ActiveSession, id: &str) -> Result<ApiKey, KeywardError> {
        self.gate
            .authority()
            .get_api_key(&session.token, id)
            .await
            .map_err(|err| match err {
                AuthorityError::NotFound(_) => KeywardError::NotFound(format!("API key {}", id)),
                other => self.absorb(session, other),
            })
    }

    fn absorb(&self, session: &ActiveSession, err: AuthorityError) -> KeywardError {
        self.gate.monitor().absorb(session, err)
    }
}

fn validate_name(name: &str) -> Result<String, KeywardError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KeywardError::InvalidArgument(
            "key name must not be empty".into(),
        ));
    }
    if name.chars().count() > MAX_KEY_NAME_LEN {
        return Err(KeywardError::InvalidArgument(format!(
            "key name must be at most {} characters",
            MAX_KEY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_days_limit(days: i64) -> Result<(), KeywardError> {
    if days > MAX_KEY_DAYS {
        return Err(KeywardError::InvalidArgument(format!(
            "days must be at most {}, got {}",
            MAX_KEY_DAYS, days
        )));
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<&str, KeywardError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(KeywardError::InvalidArgument("key id must not be empty".into()));
    }
    Ok(id)
}

fn deleted_conflict(id: &str, action: &str) -> KeywardError {
    KeywardError::Conflict(format!("cannot {} API key {}: it is deleted", action, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert_eq!(validate_name("  ci-pipeline ").unwrap(), "ci-pipeline");
        assert!(matches!(
            validate_name("   "),
            Err(KeywardError::InvalidArgument(_))
        ));
        assert!(validate_name(&"x".repeat(MAX_KEY_NAME_LEN)).is_ok());
        assert!(validate_name(&"x".repeat(MAX_KEY_NAME_LEN + 1)).is_err());
        assert!(validate_name(&"é".repeat(MAX_KEY_NAME_LEN)).is_ok());
    }

    #[test]
    fn test_id_validation() {
        assert_eq!(validate_id(" 7 ").unwrap(), "7");
        assert!(validate_id("").is_err());
    }

    #[test]
    fn test_conflict_message_names_action() {
        let err = deleted_conflict("9", "resume");
        assert!(err.to_string().contains("cannot resume API key 9"));
    }
}

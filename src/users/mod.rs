//! User administration
//!
//! Admin-only operations on the authority's user table. Changes that could
//! strip the last active administrator go through the gate's last-admin check
//! before anything is sent.

mod types;

pub use types::{NewUser, User, UserChange};

use crate::gate::{Capability, Gate};
use crate::session::ActiveSession;
use crate::KeywardError;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Manages users through the identity authority
pub struct UserAdmin {
    gate: Arc<Gate>,
}

impl UserAdmin {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self { gate }
    }

    pub async fn list(&self) -> Result<Vec<User>, KeywardError> {
        let session = self.gate.authorize(Capability::ManageUsers).await?;
        let users = self
            .gate
            .authority()
            .list_users(&session.token)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err))?;
        self.gate.monitor().ensure_current(&session)?;
        Ok(users)
    }

    pub async fn create(&self, user: NewUser) -> Result<User, KeywardError> {
        if user.username.trim().is_empty() {
            return Err(KeywardError::InvalidArgument(
                "username must not be empty".into(),
            ));
        }
        if user.password.expose_secret().is_empty() {
            return Err(KeywardError::InvalidArgument(
                "password must not be empty".into(),
            ));
        }

        let session = self.gate.authorize(Capability::ManageUsers).await?;
        let created = self
            .gate
            .authority()
            .create_user(&session.token, &user)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err).non_idempotent())?;
        self.gate.monitor().ensure_current(&session)?;

        info!(user_id = %created.id, username = %created.username, "User created");
        Ok(created)
    }

    pub async fn activate(&self, user_id: &str) -> Result<(), KeywardError> {
        let session = self.vet(user_id, &UserChange::Activate).await?;
        self.gate
            .authority()
            .set_user_status(&session.token, user_id, true)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err))?;
        self.finish(&session, user_id, "User activated")
    }

    pub async fn deactivate(&self, user_id: &str) -> Result<(), KeywardError> {
        let session = self.vet(user_id, &UserChange::Deactivate).await?;
        self.gate
            .authority()
            .set_user_status(&session.token, user_id, false)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err))?;
        self.finish(&session, user_id, "User deactivated")
    }

    /// Replace a user's role set
    pub async fn set_roles(
        &self,
        user_id: &str,
        roles: HashSet<String>,
    ) -> Result<(), KeywardError> {
        let roles: HashSet<String> = roles
            .into_iter()
            .map(|role| role.trim().to_string())
            .filter(|role| !role.is_empty())
            .collect();
        let session = self
            .vet(user_id, &UserChange::SetRoles(roles.clone()))
            .await?;
        self.gate
            .authority()
            .set_user_roles(&session.token, user_id, &roles)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err))?;
        self.finish(&session, user_id, "User roles replaced")
    }

    pub async fn reset_password(
        &self,
        user_id: &str,
        new_password: SecretString,
    ) -> Result<(), KeywardError> {
        if new_password.expose_secret().is_empty() {
            return Err(KeywardError::InvalidArgument(
                "password must not be empty".into(),
            ));
        }
        let session = self.vet(user_id, &UserChange::ResetPassword).await?;
        self.gate
            .authority()
            .reset_password(&session.token, user_id, &new_password)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err))?;
        self.finish(&session, user_id, "User password reset")
    }

    pub async fn delete(&self, user_id: &str) -> Result<(), KeywardError> {
        let session = self.vet(user_id, &UserChange::Delete).await?;
        self.gate
            .authority()
            .delete_user(&session.token, user_id)
            .await
            .map_err(|err| self.gate.monitor().absorb(&session, err))?;
        self.finish(&session, user_id, "User deleted")
    }

    /// Authorize and run the last-admin check
    async fn vet(&self, user_id: &str, change: &UserChange) -> Result<ActiveSession, KeywardError> {
        if user_id.trim().is_empty() {
            return Err(KeywardError::InvalidArgument(
                "user id must not be empty".into(),
            ));
        }
        let session = self.gate.authorize(Capability::ManageUsers).await?;
        self.gate.check_user_change(&session, user_id, change).await?;
        Ok(session)
    }

    fn finish(
        &self,
        session: &ActiveSession,
        user_id: &str,
        message: &'static str,
    ) -> Result<(), KeywardError> {
        self.gate.monitor().ensure_current(session)?;
        info!(user_id, subject = session.subject(), "{}", message);
        Ok(())
    }
}

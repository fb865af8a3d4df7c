//! Authorization gate
//!
//! Answers "may the caller do this" from the session's roles. The synchronous
//! predicates are for rendering decisions; `authorize` revalidates against the
//! authority first and is what every privileged dispatch goes through.

mod types;

pub use types::{
    capabilities_for, permits, role_capabilities, Capability, Denial, ROLE_ADMIN, ROLE_USER,
};

use crate::authority::IdentityAuthority;
use crate::session::{ActiveSession, SessionMonitor, SessionState};
use crate::users::UserChange;
use crate::KeywardError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capability decisions for one session
pub struct Gate {
    monitor: Arc<SessionMonitor>,
}

impl Gate {
    pub fn new(monitor: Arc<SessionMonitor>) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &Arc<SessionMonitor> {
        &self.monitor
    }

    pub(crate) fn authority(&self) -> &Arc<dyn IdentityAuthority> {
        self.monitor.authority()
    }

    /// Capabilities the current session holds; empty when unauthenticated
    pub fn capabilities(&self) -> HashSet<Capability> {
        if !self.monitor.is_authenticated() {
            return HashSet::new();
        }
        capabilities_for(&self.monitor.current_roles())
    }

    /// Whether the session's roles grant `capability`
    pub fn can_perform(&self, capability: Capability) -> bool {
        self.monitor.is_authenticated() && capability.granted_by(&self.monitor.current_roles())
    }

    /// Whether the session may exercise `capability` on a resource owned by
    /// `owner_id`
    pub fn can_perform_on(&self, capability: Capability, owner_id: &str) -> bool {
        let Some(subject) = self.monitor.subject() else {
            return false;
        };
        permits(
            &subject,
            &self.monitor.current_roles(),
            capability,
            Some(owner_id),
        )
    }

    /// Decide on a capability by name. Unknown names are denied.
    pub fn can_perform_named(&self, name: &str) -> bool {
        Capability::parse(name).is_some_and(|capability| self.can_perform(capability))
    }

    /// Revalidate the session and require `capability`.
    ///
    /// Returns the session snapshot the caller must dispatch under.
    pub async fn authorize(&self, capability: Capability) -> Result<ActiveSession, KeywardError> {
        if self.monitor.revalidate().await != SessionState::Authenticated {
            return Err(KeywardError::Unauthenticated);
        }
        let session = self.monitor.active()?;
        if !capability.granted_by(session.roles()) {
            debug!(subject = session.subject(), %capability, "Capability denied");
            return Err(KeywardError::Forbidden(Denial::MissingCapability(
                capability,
            )));
        }
        Ok(session)
    }

    /// Require `capability` on a resource owned by `owner_id`
    pub fn require_owner(
        &self,
        session: &ActiveSession,
        capability: Capability,
        resource: &str,
        owner_id: &str,
    ) -> Result<(), KeywardError> {
        if permits(session.subject(), session.roles(), capability, Some(owner_id)) {
            return Ok(());
        }
        debug!(
            subject = session.subject(),
            resource,
            owner_id,
            "Ownership check denied"
        );
        if capability.granted_by(session.roles()) {
            Err(KeywardError::Forbidden(Denial::NotOwner {
                resource: resource.to_string(),
            }))
        } else {
            Err(KeywardError::Forbidden(Denial::MissingCapability(
                capability,
            )))
        }
    }

    /// Refuse a user change that would leave no active administrator.
    ///
    /// Applies regardless of the caller's own role. The user list comes from
    /// the authority at call time.
    pub async fn check_user_change(
        &self,
        session: &ActiveSession,
        target_id: &str,
        change: &UserChange,
    ) -> Result<(), KeywardError> {
        let users = self
            .authority()
            .list_users(&session.token)
            .await
            .map_err(|err| self.monitor.absorb(session, err))?;

        let target = users
            .iter()
            .find(|user| user.id == target_id)
            .ok_or_else(|| KeywardError::NotFound(format!("user {}", target_id)))?;

        if !change.removes_active_admin(target) {
            return Ok(());
        }

        let remaining = users
            .iter()
            .filter(|user| user.id != target_id && user.is_active_admin())
            .count();
        if remaining == 0 {
            warn!(
                target = target_id,
                subject = session.subject(),
                "Refusing change that would remove the last active administrator"
            );
            return Err(KeywardError::Forbidden(Denial::LastActiveAdmin {
                user_id: target_id.to_string(),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MemoryAuthority;
    use secrecy::SecretString;

    async fn gate_for(roles: &[&str]) -> (Arc<MemoryAuthority>, Gate) {
        let authority = Arc::new(MemoryAuthority::new());
        authority.add_user("caller", "pw", roles);
        let monitor = Arc::new(SessionMonitor::new(authority.clone()));
        monitor
            .login("caller", &SecretString::from("pw"))
            .await
            .unwrap();
        (authority, Gate::new(monitor))
    }

    #[tokio::test]
    async fn test_unauthenticated_holds_nothing() {
        let authority = Arc::new(MemoryAuthority::new());
        let gate = Gate::new(Arc::new(SessionMonitor::new(authority)));

        assert!(gate.capabilities().is_empty());
        for capability in Capability::all() {
            assert!(!gate.can_perform(capability));
        }
        assert!(matches!(
            gate.authorize(Capability::ViewHealth).await,
            Err(KeywardError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_user_role_decisions() {
        let (_, gate) = gate_for(&[ROLE_USER]).await;

        assert!(gate.can_perform(Capability::UploadScans));
        assert!(!gate.can_perform(Capability::ManageUsers));
        assert!(gate.can_perform_named("view_scans"));
        assert!(!gate.can_perform_named("delete_everything"));

        let subject = gate.monitor().subject().unwrap();
        assert!(gate.can_perform_on(Capability::ManageOwnApiKey, &subject));
        assert!(!gate.can_perform_on(Capability::ManageOwnApiKey, "someone-else"));
    }

    #[tokio::test]
    async fn test_admin_bypasses_ownership() {
        let (_, gate) = gate_for(&[ROLE_ADMIN]).await;
        assert!(gate.can_perform_on(Capability::ManageOwnApiKey, "someone-else"));
        assert_eq!(gate.capabilities(), Capability::all());
    }

    #[tokio::test]
    async fn test_authorize_uses_revoked_roles() {
        let (authority, gate) = gate_for(&[ROLE_ADMIN]).await;
        let subject = gate.monitor().subject().unwrap();

        authority.replace_roles(&subject, &[ROLE_USER]);
        let err = gate.authorize(Capability::ManageUsers).await.unwrap_err();
        assert_eq!(
            err.denial(),
            Some(&Denial::MissingCapability(Capability::ManageUsers))
        );
    }

    #[tokio::test]
    async fn test_require_owner_names_the_reason() {
        let (_, gate) = gate_for(&[ROLE_USER]).await;
        let session = gate.authorize(Capability::ManageOwnApiKey).await.unwrap();

        let err = gate
            .require_owner(&session, Capability::ManageOwnApiKey, "key-1", "other")
            .unwrap_err();
        assert_eq!(
            err.denial(),
            Some(&Denial::NotOwner {
                resource: "key-1".into()
            })
        );
        assert!(gate
            .require_owner(&session, Capability::ManageOwnApiKey, "key-1", session.subject())
            .is_ok());
    }
}

//! User record types

use crate::gate::ROLE_ADMIN;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A user as reported by the identity authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UserWire")]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub roles: HashSet<String>,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(ROLE_ADMIN)
    }

    /// Counted by the last-admin invariant
    pub fn is_active_admin(&self) -> bool {
        self.is_active && self.is_admin()
    }
}

#[derive(Deserialize)]
struct UserWire {
    #[serde(deserialize_with = "crate::wire::id")]
    id: String,
    username: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default, deserialize_with = "crate::wire::role_names")]
    roles: Vec<String>,
    #[serde(default = "default_active")]
    is_active: bool,
    #[serde(default, deserialize_with = "crate::wire::opt_timestamp")]
    created_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl From<UserWire> for User {
    fn from(wire: UserWire) -> Self {
        Self {
            id: wire.id,
            username: wire.username,
            email: wire.email,
            roles: wire.roles.into_iter().collect(),
            is_active: wire.is_active,
            created_at: wire.created_at,
        }
    }
}

/// Request to create a user
#[derive(Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: SecretString,
    pub roles: HashSet<String>,
    pub is_active: bool,
}

impl NewUser {
    /// Active user with no roles
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: SecretString::from(password.into()),
            roles: HashSet::new(),
            is_active: true,
        }
    }

    /// Add a role to the new user
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }
}

/// A change to an existing user that the gate must vet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserChange {
    Activate,
    Deactivate,
    SetRoles(HashSet<String>),
    ResetPassword,
    Delete,
}

impl UserChange {
    /// Whether applying this change to `user` takes away active admin standing
    pub fn removes_active_admin(&self, user: &User) -> bool {
        if !user.is_active_admin() {
            return false;
        }
        match self {
            UserChange::Deactivate | UserChange::Delete => true,
            UserChange::SetRoles(roles) => !roles.contains(ROLE_ADMIN),
            UserChange::Activate | UserChange::ResetPassword => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(roles: &[&str], active: bool) -> User {
        User {
            id: "1".into(),
            username: "root".into(),
            email: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            is_active: active,
            created_at: None,
        }
    }

    #[test]
    fn test_parse_user_with_role_objects() {
        let parsed: User = serde_json::from_str(
            r#"{"id": 5, "username": "dana", "email": "dana@example.com",
                "roles": [{"id": 1, "name": "admin"}], "is_active": true,
                "created_at": "2024-01-01T00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, "5");
        assert!(parsed.is_active_admin());
    }

    #[test]
    fn test_missing_fields_default() {
        let parsed: User = serde_json::from_str(r#"{"id": "u1", "username": "eve"}"#).unwrap();
        assert!(parsed.is_active);
        assert!(parsed.roles.is_empty());
        assert!(!parsed.is_admin());
    }

    #[test]
    fn test_changes_that_remove_admin() {
        let admin = user(&[ROLE_ADMIN], true);
        assert!(UserChange::Deactivate.removes_active_admin(&admin));
        assert!(UserChange::Delete.removes_active_admin(&admin));
        assert!(UserChange::SetRoles(HashSet::new()).removes_active_admin(&admin));
        assert!(!UserChange::SetRoles(["admin".to_string()].into_iter().collect())
            .removes_active_admin(&admin));
        assert!(!UserChange::ResetPassword.removes_active_admin(&admin));

        let inactive_admin = user(&[ROLE_ADMIN], false);
        assert!(!UserChange::Delete.removes_active_admin(&inactive_admin));

        let plain = user(&["user"], true);
        assert!(!UserChange::Deactivate.removes_active_admin(&plain));
    }
}

//! Capability and role types for the authorization gate
//!
//! Provides:
//! - Capability enum, the closed set of actions a consumer can ask about
//! - The static role-to-capability mapping
//! - Denial reasons surfaced with `Forbidden`

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Distinguished administrator role
pub const ROLE_ADMIN: &str = "admin";
/// Regular operator role
pub const ROLE_USER: &str = "user";

/// Actions the gate can decide on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Read service health status
    ViewHealth,
    /// Browse scan results
    ViewScans,
    /// Upload new scan results
    UploadScans,
    /// Manage API keys the caller owns
    ManageOwnApiKey,
    /// Manage every user's API keys
    ManageAnyApiKey,
    /// Create, edit, deactivate and delete users
    ManageUsers,
}

impl Capability {
    /// Get all capabilities
    pub fn all() -> HashSet<Capability> {
        [
            Capability::ViewHealth,
            Capability::ViewScans,
            Capability::UploadScans,
            Capability::ManageOwnApiKey,
            Capability::ManageAnyApiKey,
            Capability::ManageUsers,
        ]
        .into_iter()
        .collect()
    }

    /// Held by every authenticated session regardless of roles
    pub fn baseline() -> HashSet<Capability> {
        [
            Capability::ViewHealth,
            Capability::ViewScans,
            Capability::ManageOwnApiKey,
        ]
        .into_iter()
        .collect()
    }

    /// Parse a capability name. Unknown names yield `None` and are always denied.
    pub fn parse(s: &str) -> Option<Capability> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "view_health" => Some(Capability::ViewHealth),
            "view_scans" => Some(Capability::ViewScans),
            "upload_scans" => Some(Capability::UploadScans),
            "manage_own_api_key" => Some(Capability::ManageOwnApiKey),
            "manage_any_api_key" => Some(Capability::ManageAnyApiKey),
            "manage_users" => Some(Capability::ManageUsers),
            _ => None,
        }
    }

    /// Ownership-scoped capabilities also require the caller to own the resource
    pub fn is_ownership_scoped(&self) -> bool {
        matches!(self, Capability::ManageOwnApiKey)
    }

    /// Whether a role set grants this capability (ownership not considered)
    pub fn granted_by(&self, roles: &HashSet<String>) -> bool {
        capabilities_for(roles).contains(self)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::ViewHealth => write!(f, "view_health"),
            Capability::ViewScans => write!(f, "view_scans"),
            Capability::UploadScans => write!(f, "upload_scans"),
            Capability::ManageOwnApiKey => write!(f, "manage_own_api_key"),
            Capability::ManageAnyApiKey => write!(f, "manage_any_api_key"),
            Capability::ManageUsers => write!(f, "manage_users"),
        }
    }
}

/// Capabilities granted by a single role name. Unknown roles grant nothing.
pub fn role_capabilities(role: &str) -> HashSet<Capability> {
    match role {
        ROLE_ADMIN => Capability::all(),
        ROLE_USER => [Capability::UploadScans].into_iter().collect(),
        _ => HashSet::new(),
    }
}

/// Capabilities of an authenticated session holding `roles`
pub fn capabilities_for(roles: &HashSet<String>) -> HashSet<Capability> {
    let mut granted = Capability::baseline();
    for role in roles {
        granted.extend(role_capabilities(role));
    }
    granted
}

/// Full decision for an authenticated subject: role grant, then ownership.
///
/// Admins bypass ownership.
pub fn permits(
    subject: &str,
    roles: &HashSet<String>,
    capability: Capability,
    owner_id: Option<&str>,
) -> bool {
    if !capability.granted_by(roles) {
        return false;
    }
    match owner_id {
        Some(owner) if capability.is_ownership_scoped() => {
            owner == subject || roles.contains(ROLE_ADMIN)
        }
        _ => true,
    }
}

/// Why the gate refused an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// The session's roles do not grant the capability
    MissingCapability(Capability),
    /// The caller neither owns the resource nor holds admin
    NotOwner { resource: String },
    /// The change would leave no active administrator
    LastActiveAdmin { user_id: String },
    /// The identity authority itself refused
    Authority(String),
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::MissingCapability(capability) => {
                write!(f, "requires '{}' capability", capability)
            }
            Denial::NotOwner { resource } => {
                write!(f, "'{}' is owned by another user", resource)
            }
            Denial::LastActiveAdmin { user_id } => write!(
                f,
                "user '{}' is the last active administrator",
                user_id
            ),
            Denial::Authority(message) => write!(f, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_capability_parsing() {
        assert_eq!(Capability::parse("manage_users"), Some(Capability::ManageUsers));
        assert_eq!(Capability::parse("Manage-Own-Api-Key"), Some(Capability::ManageOwnApiKey));
        assert_eq!(Capability::parse("launch_missiles"), None);
        assert_eq!(Capability::parse(""), None);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for capability in Capability::all() {
            assert_eq!(Capability::parse(&capability.to_string()), Some(capability));
        }
    }

    #[test]
    fn test_role_mapping() {
        let admin = capabilities_for(&roles(&[ROLE_ADMIN]));
        assert_eq!(admin, Capability::all());

        let user = capabilities_for(&roles(&[ROLE_USER]));
        assert!(user.contains(&Capability::UploadScans));
        assert!(user.contains(&Capability::ManageOwnApiKey));
        assert!(!user.contains(&Capability::ManageUsers));
        assert!(!user.contains(&Capability::ManageAnyApiKey));

        let nobody = capabilities_for(&roles(&["auditor"]));
        assert_eq!(nobody, Capability::baseline());
    }

    #[test]
    fn test_ownership_requires_owner_or_admin() {
        let user = roles(&[ROLE_USER]);
        assert!(permits("1", &user, Capability::ManageOwnApiKey, Some("1")));
        assert!(!permits("1", &user, Capability::ManageOwnApiKey, Some("2")));

        let admin = roles(&[ROLE_ADMIN]);
        assert!(permits("1", &admin, Capability::ManageOwnApiKey, Some("2")));
    }

    #[test]
    fn test_owner_ignored_for_unscoped_capabilities() {
        let admin = roles(&[ROLE_ADMIN]);
        assert!(permits("1", &admin, Capability::ManageUsers, Some("9")));

        let user = roles(&[ROLE_USER]);
        assert!(!permits("1", &user, Capability::ManageUsers, Some("1")));
    }

    #[test]
    fn test_denial_messages() {
        let denial = Denial::MissingCapability(Capability::ManageUsers);
        assert_eq!(denial.to_string(), "requires 'manage_users' capability");

        let denial = Denial::LastActiveAdmin { user_id: "1".into() };
        assert!(denial.to_string().contains("last active administrator"));
    }
}

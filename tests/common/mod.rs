//! Shared fixtures for integration tests
#![allow(dead_code)]

use keyward::authority::MemoryAuthority;
use keyward::{ApiKeyManager, Gate, SessionMonitor, UserAdmin};
use secrecy::SecretString;
use std::sync::Arc;

pub const PASSWORD: &str = "correct horse battery staple";

/// One client-side session with its gate and managers
pub struct Client {
    pub monitor: Arc<SessionMonitor>,
    pub gate: Arc<Gate>,
    pub keys: ApiKeyManager,
    pub users: UserAdmin,
}

impl Client {
    pub fn new(authority: &Arc<MemoryAuthority>) -> Self {
        let monitor = Arc::new(SessionMonitor::new(authority.clone()));
        let gate = Arc::new(Gate::new(monitor.clone()));
        Self {
            monitor,
            keys: ApiKeyManager::new(gate.clone()),
            users: UserAdmin::new(gate.clone()),
            gate,
        }
    }

    /// Client already logged in as `username`
    pub async fn login(authority: &Arc<MemoryAuthority>, username: &str) -> Self {
        let client = Self::new(authority);
        client
            .monitor
            .login(username, &SecretString::from(PASSWORD))
            .await
            .unwrap();
        client
    }

    pub fn subject(&self) -> String {
        self.monitor.subject().unwrap()
    }
}

/// Authority with an admin ("root") and two regular users ("alice", "bob")
pub fn seeded_authority() -> Arc<MemoryAuthority> {
    let authority = Arc::new(MemoryAuthority::new());
    authority.add_user("root", PASSWORD, &["admin"]);
    authority.add_user("alice", PASSWORD, &["user"]);
    authority.add_user("bob", PASSWORD, &["user"]);
    authority
}

//! Session monitor
//!
//! Owns the bearer token and the session state machine:
//!
//! ```text
//! Unauthenticated --login/establish--> Authenticated
//! Authenticated --decode failure | expiry | logout | authority 401--> Unauthenticated
//! ```
//!
//! `Expired` is what a read observes once the token's expiry has passed; the
//! next `revalidate` collapses it to `Unauthenticated`. Every identity change
//! bumps a generation counter so in-flight calls can detect that the session
//! they started under is gone.

use crate::authority::{AuthorityError, IdentityAuthority};
use crate::gate::ROLE_ADMIN;
use crate::token::{self, Claims};
use crate::KeywardError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default period of the background role poll
pub const DEFAULT_REVALIDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    /// Token expiry passed; collapses to `Unauthenticated` on revalidation
    Expired,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unauthenticated => write!(f, "unauthenticated"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Default)]
struct Session {
    token: Option<Arc<SecretString>>,
    claims: Option<Claims>,
    /// Last role set reported by the authority; preferred over claims
    authoritative_roles: Option<HashSet<String>>,
    generation: u64,
}

impl Session {
    fn state_at(&self, now: DateTime<Utc>) -> SessionState {
        match (&self.token, &self.claims) {
            (Some(_), Some(claims)) if claims.is_expired_at(now) => SessionState::Expired,
            (Some(_), Some(_)) => SessionState::Authenticated,
            _ => SessionState::Unauthenticated,
        }
    }

    fn roles(&self) -> HashSet<String> {
        match (&self.authoritative_roles, &self.claims) {
            (Some(roles), _) => roles.clone(),
            (None, Some(claims)) => claims.roles.clone(),
            (None, None) => HashSet::new(),
        }
    }

    /// Drop the credential and move to a new generation
    fn clear(&mut self) -> bool {
        let had_token = self.token.is_some();
        self.token = None;
        self.claims = None;
        self.authoritative_roles = None;
        self.generation += 1;
        had_token
    }
}

/// Snapshot of an authenticated session taken before a privileged dispatch
#[derive(Clone)]
pub struct ActiveSession {
    pub(crate) token: Arc<SecretString>,
    subject: String,
    username: String,
    roles: HashSet<String>,
    generation: u64,
}

impl ActiveSession {
    /// Identity used for ownership checks
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn roles(&self) -> &HashSet<String> {
        &self.roles
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(ROLE_ADMIN)
    }

    /// Session generation this snapshot was taken in
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("subject", &self.subject)
            .field("username", &self.username)
            .field("roles", &self.roles)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct RevalidationTask {
    /// Dropping the sender stops the loop
    _shutdown: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owner of the client session
pub struct SessionMonitor {
    authority: Arc<dyn IdentityAuthority>,
    session: RwLock<Session>,
    state_tx: watch::Sender<SessionState>,
    revalidation: Mutex<Option<RevalidationTask>>,
}

impl SessionMonitor {
    /// Create an unauthenticated monitor
    pub fn new(authority: Arc<dyn IdentityAuthority>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            authority,
            session: RwLock::new(Session::default()),
            state_tx,
            revalidation: Mutex::new(None),
        }
    }

    pub(crate) fn authority(&self) -> &Arc<dyn IdentityAuthority> {
        &self.authority
    }

    // ==================== Transitions ====================

    /// Exchange a username and password for a token and establish it
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<SessionState, KeywardError> {
        let token = self
            .authority
            .exchange_credentials(username, password)
            .await
            .map_err(KeywardError::from)?;
        self.establish(token).await
    }

    /// Adopt a bearer token.
    ///
    /// An undecodable or already expired token leaves the session
    /// unauthenticated. On success the authority's role set is fetched
    /// best-effort.
    pub async fn establish(&self, token: SecretString) -> Result<SessionState, KeywardError> {
        let claims = match token::decode(token.expose_secret()) {
            Ok(claims) => claims,
            Err(err) => {
                self.teardown("undecodable token");
                return Err(err.into());
            }
        };
        if claims.is_expired() {
            self.teardown("token already expired");
            return Err(KeywardError::Unauthenticated);
        }

        let token = Arc::new(token);
        let generation = {
            let mut session = self.session.write();
            session.generation += 1;
            session.token = Some(token.clone());
            session.authoritative_roles = None;
            info!(
                subject = %claims.subject,
                username = %claims.username,
                expires_at = %claims.expires_at,
                "Session established"
            );
            session.claims = Some(claims);
            session.generation
        };
        self.publish(SessionState::Authenticated);

        match self.authority.current_roles(&token).await {
            Ok(roles) => {
                self.apply_roles(generation, roles);
                Ok(self.state())
            }
            Err(AuthorityError::Unauthorized) => {
                self.teardown_if(generation, "authority rejected token");
                Err(KeywardError::Unauthenticated)
            }
            Err(err) => {
                warn!(error = %err, "Role fetch failed, using token claims");
                Ok(self.state())
            }
        }
    }

    /// Re-check the stored token and poll the authority's role set
    pub async fn revalidate(&self) -> SessionState {
        let (token, generation) = {
            let session = self.session.read();
            match &session.token {
                Some(token) => (token.clone(), session.generation),
                None => return SessionState::Unauthenticated,
            }
        };

        match token::decode(token.expose_secret()) {
            Ok(claims) if !claims.is_expired() => {}
            Ok(_) => {
                self.teardown_if(generation, "token expired");
                return SessionState::Unauthenticated;
            }
            Err(_) => {
                self.teardown_if(generation, "undecodable token");
                return SessionState::Unauthenticated;
            }
        }

        match self.authority.current_roles(&token).await {
            Ok(roles) => self.apply_roles(generation, roles),
            Err(AuthorityError::Unauthorized) => {
                self.teardown_if(generation, "authority rejected token");
                return SessionState::Unauthenticated;
            }
            Err(err) => {
                warn!(error = %err, "Role poll failed, keeping last known roles");
            }
        }
        self.state()
    }

    /// End the session. Local state is always cleared; the authority is told
    /// best-effort.
    pub async fn logout(&self) {
        let token = {
            let mut session = self.session.write();
            let token = session.token.take();
            session.clear();
            token
        };
        self.stop_revalidation();
        self.publish(SessionState::Unauthenticated);

        if let Some(token) = token {
            info!("Session logged out");
            if let Err(err) = self.authority.logout(&token).await {
                debug!(error = %err, "Logout notification failed");
            }
        }
    }

    // ==================== Reads ====================

    /// Current state; observes expiry
    pub fn state(&self) -> SessionState {
        let state = self.session.read().state_at(Utc::now());
        self.publish(state);
        state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Roles of an authenticated, unexpired session; empty otherwise
    pub fn current_roles(&self) -> HashSet<String> {
        let session = self.session.read();
        if session.state_at(Utc::now()) != SessionState::Authenticated {
            return HashSet::new();
        }
        session.roles()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.current_roles().contains(role)
    }

    /// Identity used for ownership checks
    pub fn subject(&self) -> Option<String> {
        self.authenticated_claims().map(|c| c.subject)
    }

    pub fn username(&self) -> Option<String> {
        self.authenticated_claims().map(|c| c.username)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.authenticated_claims().map(|c| c.expires_at)
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn authenticated_claims(&self) -> Option<Claims> {
        let session = self.session.read();
        match session.state_at(Utc::now()) {
            SessionState::Authenticated => session.claims.clone(),
            _ => None,
        }
    }

    // ==================== Background revalidation ====================

    /// Spawn the periodic role poll. Replaces any running poll.
    ///
    /// The task ends when stopped, when the session is torn down, or when the
    /// monitor is dropped.
    pub fn start_revalidation(self: &Arc<Self>, interval: Duration) {
        self.stop_revalidation();
        let interval = if interval.is_zero() {
            DEFAULT_REVALIDATE_INTERVAL
        } else {
            interval
        };

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let monitor: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else {
                            break;
                        };
                        if monitor.revalidate().await == SessionState::Unauthenticated {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Revalidation task received shutdown signal");
                        break;
                    }
                }
            }
        });

        debug!(interval_secs = interval.as_secs(), "Revalidation task started");
        *self.revalidation.lock() = Some(RevalidationTask {
            _shutdown: shutdown_tx,
            handle,
        });
    }

    /// Cancel the periodic role poll
    pub fn stop_revalidation(&self) {
        if self.revalidation.lock().take().is_some() {
            debug!("Revalidation task stopped");
        }
    }

    /// Whether a periodic role poll is running
    pub fn is_revalidating(&self) -> bool {
        self.revalidation
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    // ==================== Crate-internal ====================

    /// Snapshot the session for a privileged call
    pub(crate) fn active(&self) -> Result<ActiveSession, KeywardError> {
        let snapshot = {
            let session = self.session.read();
            let state = session.state_at(Utc::now());
            match (&session.token, &session.claims) {
                (Some(token), Some(claims)) if state == SessionState::Authenticated => {
                    Ok(ActiveSession {
                        token: token.clone(),
                        subject: claims.subject.clone(),
                        username: claims.username.clone(),
                        roles: session.roles(),
                        generation: session.generation,
                    })
                }
                _ => Err(state),
            }
        };
        snapshot.map_err(|state| {
            self.publish(state);
            KeywardError::Unauthenticated
        })
    }

    /// Fail with `StaleSession` if the identity changed since `active`
    pub(crate) fn ensure_current(&self, snapshot: &ActiveSession) -> Result<(), KeywardError> {
        let session = self.session.read();
        let same_subject = session
            .claims
            .as_ref()
            .is_some_and(|c| c.subject == snapshot.subject);
        if session.generation == snapshot.generation && same_subject {
            Ok(())
        } else {
            Err(KeywardError::StaleSession)
        }
    }

    /// Convert an authority failure seen under `snapshot`, tearing the
    /// session down on a 401
    pub(crate) fn absorb(&self, snapshot: &ActiveSession, err: AuthorityError) -> KeywardError {
        if err == AuthorityError::Unauthorized {
            self.teardown_if(snapshot.generation, "authority rejected token");
        }
        err.into()
    }

    // ==================== Internals ====================

    fn apply_roles(&self, generation: u64, roles: HashSet<String>) {
        let mut session = self.session.write();
        if session.generation == generation {
            debug!(roles = ?roles, "Authoritative roles updated");
            session.authoritative_roles = Some(roles);
        }
    }

    fn teardown(&self, reason: &'static str) {
        let had_token = self.session.write().clear();
        self.after_teardown(had_token, reason);
    }

    /// Tear down only if no other identity change happened since `generation`
    fn teardown_if(&self, generation: u64, reason: &'static str) {
        let had_token = {
            let mut session = self.session.write();
            if session.generation != generation {
                return;
            }
            session.clear()
        };
        self.after_teardown(had_token, reason);
    }

    fn after_teardown(&self, had_token: bool, reason: &'static str) {
        if had_token {
            info!(reason, "Session torn down");
        }
        self.stop_revalidation();
        self.publish(SessionState::Unauthenticated);
    }

    fn publish(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MemoryAuthority;

    fn monitor() -> (Arc<MemoryAuthority>, SessionMonitor) {
        let authority = Arc::new(MemoryAuthority::new());
        let monitor = SessionMonitor::new(authority.clone());
        (authority, monitor)
    }

    #[tokio::test]
    async fn test_garbage_token_leaves_unauthenticated() {
        let (_, monitor) = monitor();

        let err = monitor
            .establish(SecretString::from("default-token"))
            .await
            .unwrap_err();

        assert!(matches!(err, KeywardError::Decode(_)));
        assert_eq!(monitor.state(), SessionState::Unauthenticated);
        assert!(monitor.current_roles().is_empty());
    }

    #[tokio::test]
    async fn test_login_prefers_authority_roles() {
        let (authority, monitor) = monitor();
        let id = authority.add_user("alice", "pw", &["user"]);

        let state = monitor
            .login("alice", &SecretString::from("pw"))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Authenticated);
        assert_eq!(monitor.subject().as_deref(), Some(id.as_str()));
        assert!(monitor.has_role("user"));

        authority.replace_roles(&id, &["admin"]);
        assert!(!monitor.has_role("admin"));

        monitor.revalidate().await;
        assert!(monitor.has_role("admin"));
        assert!(!monitor.has_role("user"));
    }

    #[tokio::test]
    async fn test_network_failure_keeps_roles() {
        let (authority, monitor) = monitor();
        authority.add_user("alice", "pw", &["user"]);
        monitor
            .login("alice", &SecretString::from("pw"))
            .await
            .unwrap();

        authority.set_offline(true);
        assert_eq!(monitor.revalidate().await, SessionState::Authenticated);
        assert!(monitor.has_role("user"));
    }

    #[tokio::test]
    async fn test_stale_snapshot_detected() {
        let (authority, monitor) = monitor();
        authority.add_user("alice", "pw", &[]);
        monitor
            .login("alice", &SecretString::from("pw"))
            .await
            .unwrap();

        let snapshot = monitor.active().unwrap();
        assert!(monitor.ensure_current(&snapshot).is_ok());

        monitor.logout().await;
        assert!(matches!(
            monitor.ensure_current(&snapshot),
            Err(KeywardError::StaleSession)
        ));
        assert!(matches!(monitor.active(), Err(KeywardError::Unauthenticated)));
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Expired.to_string(), "expired");
        assert_eq!(
            serde_json::to_value(SessionState::Authenticated).unwrap(),
            "authenticated"
        );
    }
}

//! Integration tests for the session state machine
//!
//! Tests the flow: authority -> session monitor -> gate

mod common;

use chrono::Duration;
use common::{seeded_authority, Client};
use keyward::authority::MemoryAuthority;
use keyward::{Capability, KeywardError, SessionState};
use secrecy::SecretString;
use std::sync::Arc;

/// An unparseable token never authenticates
#[tokio::test]
async fn test_unparseable_token_stays_unauthenticated() {
    let authority = seeded_authority();
    let client = Client::new(&authority);

    for garbage in ["", "default-token", "a.b.c", "eyJhbGciOiJIUzI1NiJ9.e30"] {
        let result = client.monitor.establish(SecretString::from(garbage)).await;
        assert!(result.is_err(), "token {:?} should be rejected", garbage);
        assert_eq!(client.monitor.state(), SessionState::Unauthenticated);
        assert!(client.monitor.current_roles().is_empty());
        assert!(!client.gate.can_perform(Capability::ViewHealth));
    }
}

/// A bad token replaces a good session rather than leaving it in place
#[tokio::test]
async fn test_bad_token_discards_existing_session() {
    let authority = seeded_authority();
    let client = Client::login(&authority, "alice").await;
    assert!(client.monitor.is_authenticated());

    let err = client
        .monitor
        .establish(SecretString::from("garbage"))
        .await
        .unwrap_err();
    assert!(matches!(err, KeywardError::Decode(_)));
    assert!(!client.monitor.is_authenticated());
}

/// Establishing an already expired token fails and leaves nothing behind
#[tokio::test]
async fn test_expired_token_rejected_on_establish() {
    let authority = seeded_authority();
    let client = Client::new(&authority);
    let token = authority.issue_token("alice", Duration::minutes(-5)).unwrap();

    let err = client
        .monitor
        .establish(SecretString::from(token))
        .await
        .unwrap_err();
    assert!(matches!(err, KeywardError::Unauthenticated));
    assert_eq!(client.monitor.state(), SessionState::Unauthenticated);
}

/// Past expiry: reads observe Expired, revalidate collapses to
/// Unauthenticated, and repeating it changes nothing
#[tokio::test]
async fn test_expiry_then_revalidate_is_idempotent() {
    let authority = seeded_authority();
    let client = Client::new(&authority);
    let token = authority.issue_token("alice", Duration::seconds(2)).unwrap();

    client
        .monitor
        .establish(SecretString::from(token))
        .await
        .unwrap();
    let mut states = client.monitor.subscribe();
    assert_eq!(*states.borrow_and_update(), SessionState::Authenticated);

    tokio::time::sleep(std::time::Duration::from_millis(3100)).await;

    assert_eq!(client.monitor.state(), SessionState::Expired);
    assert!(client.monitor.current_roles().is_empty());
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), SessionState::Expired);

    assert_eq!(client.monitor.revalidate().await, SessionState::Unauthenticated);
    assert_eq!(client.monitor.revalidate().await, SessionState::Unauthenticated);
    assert_eq!(client.monitor.state(), SessionState::Unauthenticated);
    assert_eq!(*states.borrow_and_update(), SessionState::Unauthenticated);
}

/// The authority's role set wins over what the token claims
#[tokio::test]
async fn test_revoked_role_takes_effect_on_revalidate() {
    let authority = seeded_authority();
    let root = Client::login(&authority, "root").await;
    assert!(root.gate.can_perform(Capability::ManageUsers));

    authority.replace_roles(&root.subject(), &["user"]);
    root.monitor.revalidate().await;

    assert!(!root.monitor.has_role("admin"));
    assert!(!root.gate.can_perform(Capability::ManageUsers));
    assert!(root.gate.can_perform(Capability::UploadScans));
}

/// A 401 from the authority tears the session down
#[tokio::test]
async fn test_server_rejection_tears_down() {
    let authority = seeded_authority();
    let root = Client::login(&authority, "root").await;
    let alice = Client::login(&authority, "alice").await;

    root.users.deactivate(&alice.subject()).await.unwrap();

    assert_eq!(alice.monitor.revalidate().await, SessionState::Unauthenticated);
    assert!(alice.monitor.subject().is_none());
}

/// Losing the network keeps the last known roles
#[tokio::test]
async fn test_network_failure_degrades_gracefully() {
    let authority = seeded_authority();
    let alice = Client::login(&authority, "alice").await;

    authority.set_offline(true);
    assert_eq!(alice.monitor.revalidate().await, SessionState::Authenticated);
    assert!(alice.monitor.has_role("user"));

    let err = alice.keys.list().await.unwrap_err();
    assert!(err.is_transient());
    assert!(alice.monitor.is_authenticated());
}

/// Logout clears local state even when the authority is unreachable
#[tokio::test]
async fn test_logout_swallows_network_failure() {
    let authority = seeded_authority();
    let alice = Client::login(&authority, "alice").await;

    authority.set_offline(true);
    alice.monitor.logout().await;

    assert_eq!(alice.monitor.state(), SessionState::Unauthenticated);
    assert!(alice.monitor.current_roles().is_empty());
}

/// Logout invalidates the token at the authority too
#[tokio::test]
async fn test_logout_invalidates_server_token() {
    let authority = seeded_authority();
    let token = authority.issue_token("alice", Duration::minutes(5)).unwrap();
    let alice = Client::new(&authority);
    alice
        .monitor
        .establish(SecretString::from(token.clone()))
        .await
        .unwrap();

    alice.monitor.logout().await;
    assert!(!authority.is_token_live(&token));
}

/// Wrong password leaves the session unauthenticated
#[tokio::test]
async fn test_login_with_wrong_password() {
    let authority = seeded_authority();
    let client = Client::new(&authority);

    let err = client
        .monitor
        .login("alice", &SecretString::from("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, KeywardError::Unauthenticated));
    assert!(!client.monitor.is_authenticated());
}

/// Two sessions against one authority do not interfere
#[tokio::test]
async fn test_independent_sessions() {
    let authority = seeded_authority();
    let root = Client::login(&authority, "root").await;
    let alice = Client::login(&authority, "alice").await;

    assert!(root.monitor.has_role("admin"));
    assert!(!alice.monitor.has_role("admin"));

    alice.monitor.logout().await;
    assert!(root.monitor.is_authenticated());
    assert!(!alice.monitor.is_authenticated());
}

/// The background poll picks up server-side role changes
#[tokio::test(start_paused = true)]
async fn test_background_revalidation_refreshes_roles() {
    let authority = seeded_authority();
    let alice = Client::login(&authority, "alice").await;

    alice
        .monitor
        .start_revalidation(std::time::Duration::from_secs(30));
    assert!(alice.monitor.is_revalidating());

    authority.replace_roles(&alice.subject(), &["admin"]);
    tokio::time::sleep(std::time::Duration::from_secs(31)).await;

    assert!(alice.monitor.has_role("admin"));
    assert!(alice.monitor.is_revalidating());
}

/// Logout cancels the background poll
#[tokio::test(start_paused = true)]
async fn test_logout_stops_background_revalidation() {
    let authority = seeded_authority();
    let alice = Client::login(&authority, "alice").await;
    alice
        .monitor
        .start_revalidation(std::time::Duration::from_secs(30));

    alice.monitor.logout().await;
    assert!(!alice.monitor.is_revalidating());

    let before = authority.request_count();
    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
    assert_eq!(authority.request_count(), before);
}

/// A 401 seen by the background poll tears down and ends the poll
#[tokio::test(start_paused = true)]
async fn test_background_revalidation_tears_down_on_rejection() {
    let authority = seeded_authority();
    let root = Client::login(&authority, "root").await;
    let alice = Client::login(&authority, "alice").await;
    alice
        .monitor
        .start_revalidation(std::time::Duration::from_secs(10));

    root.users.delete(&alice.subject()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(11)).await;

    assert_eq!(alice.monitor.state(), SessionState::Unauthenticated);
    assert!(!alice.monitor.is_revalidating());
}

/// Dropping every handle to the monitor releases it despite a running poll
#[tokio::test]
async fn test_dropping_monitor_releases_it() {
    let authority: Arc<MemoryAuthority> = seeded_authority();
    let alice = Client::login(&authority, "alice").await;
    alice
        .monitor
        .start_revalidation(std::time::Duration::from_secs(60));

    let weak = Arc::downgrade(&alice.monitor);
    drop(alice);
    assert!(weak.upgrade().is_none());
}

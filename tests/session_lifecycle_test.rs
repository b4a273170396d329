//! Session lifecycle across restarts, logouts and rejected calls

use anyhow::Result;
use std::sync::Arc;

use switchboard_config::SessionConfig;
use switchboard_rbac::{PermissionScope, TenantId};
use switchboard_session::testing::{secret, Call, Harness, MockBackend};
use switchboard_session::{
    AuthorizationError, CredentialStores, FileTokenStorage, IdentityError, MemoryCookieJar, MemoryTokenStorage,
    SessionError, SessionManager, SessionState,
};

fn file_backed(backend: &Arc<MockBackend>, path: &std::path::Path) -> SessionManager {
    let stores = CredentialStores::new(
        Arc::new(FileTokenStorage::new(path)),
        Arc::new(MemoryCookieJar::new()),
        SessionConfig::default(),
    );
    SessionManager::new(backend.clone(), backend.clone(), stores)
}

#[tokio::test]
async fn test_double_logout_matches_single_logout() -> Result<()> {
    let once = Harness::acme();
    once.login("alice@acme.test", "alice-pw").await?;
    let after_one = once.manager.logout().await;

    let twice = Harness::acme();
    twice.login("alice@acme.test", "alice-pw").await?;
    twice.manager.logout().await;
    let after_two = twice.manager.logout().await;

    assert_eq!(after_one.state, after_two.state);
    assert!(after_two.session.is_none());
    assert!(once.stores_empty());
    assert!(twice.stores_empty());
    assert_eq!(once.storage.entries(), twice.storage.entries());
    Ok(())
}

#[tokio::test]
async fn test_restart_restores_tenant_and_permissions() -> Result<()> {
    let backend = Arc::new(MockBackend::acme());
    let storage = Arc::new(MemoryTokenStorage::new());

    let first = Harness::with_storage(backend.clone(), storage.clone());
    first.login("alice@acme.test", "alice-pw").await?;
    first.manager.switch_tenant(&TenantId::new("fr")).await?;
    let before = first.manager.snapshot();

    let restarted = Harness::with_storage(backend, storage);
    let after = restarted.manager.initialize().await?;

    assert_eq!(after.state, SessionState::TenantActive);
    assert_eq!(
        after.active_tenant().map(|t| &t.id),
        before.active_tenant().map(|t| &t.id)
    );
    assert_eq!(after.permissions(), before.permissions());
    assert_eq!(after.credential(), before.credential());
    Ok(())
}

#[tokio::test]
async fn test_file_storage_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session").join("credentials.json");
    let backend = Arc::new(MockBackend::acme());

    let first = file_backed(&backend, &path);
    first.login("bob@acme.test", secret("bob-pw")).await?;
    assert!(path.exists());

    let restarted = file_backed(&backend, &path);
    let snapshot = restarted.initialize().await?;
    assert!(snapshot.is_authenticated());
    assert_eq!(snapshot.active_tenant().map(|t| t.id.as_str()), Some("fr"));

    restarted.logout().await;
    let after_logout = file_backed(&backend, &path);
    let snapshot = after_logout.initialize().await?;
    assert_eq!(snapshot.state, SessionState::Unauthenticated);
    Ok(())
}

#[tokio::test]
async fn test_revoked_credential_is_purged_on_restart() -> Result<()> {
    let backend = Arc::new(MockBackend::acme());
    let storage = Arc::new(MemoryTokenStorage::new());
    let first = Harness::with_storage(backend.clone(), storage.clone());
    first.login("bob@acme.test", "bob-pw").await?;

    backend.revoke_all();
    let restarted = Harness::with_storage(backend, storage.clone());
    let snapshot = restarted.manager.initialize().await?;

    assert_eq!(snapshot.state, SessionState::Unauthenticated);
    assert!(storage.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_denied_switch_leaves_everything_untouched() -> Result<()> {
    let harness = Harness::acme();
    harness.login("bob@acme.test", "bob-pw").await?;
    let before = harness.manager.snapshot();
    let writes = harness.store_writes();

    let err = harness
        .manager
        .switch_tenant(&TenantId::new("emea"))
        .await
        .expect_err("bob may not enter emea");

    assert!(matches!(
        err,
        SessionError::Authorization(AuthorizationError::TenantSwitchDenied { .. })
    ));
    assert_eq!(harness.store_writes(), writes);
    assert_eq!(harness.manager.snapshot().session, before.session);
    assert_eq!(harness.backend.call_count(Call::SwitchTenant), 0);
    Ok(())
}

#[tokio::test]
async fn test_unauthorized_call_forces_sign_out() -> Result<()> {
    let harness = Harness::acme();
    harness.login("alice@acme.test", "alice-pw").await?;
    let mut updates = harness.manager.subscribe();

    let backend = harness.backend.clone();
    let result: Result<(), SessionError> = harness
        .manager
        .authorized(|_credential| async move {
            backend.revoke_all();
            Err(IdentityError::Unauthorized)
        })
        .await;

    assert!(result.expect_err("rejected").is_unauthorized());
    updates.changed().await?;
    assert_eq!(updates.borrow().state, SessionState::Unauthenticated);
    assert!(harness.stores_empty());
    assert!(!harness
        .manager
        .has_permission("agents", "read", Some(PermissionScope::Tenant)));
    Ok(())
}

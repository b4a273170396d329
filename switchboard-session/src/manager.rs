//! Session/identity manager
//!
//! Owns the session aggregate and is the only writer of the credential stores.
//! Network calls happen first; their results are applied afterwards in one
//! synchronous step under the state lock, which is never held across an
//! `.await`. Each operation kind carries a generation counter so that a call
//! superseded by a newer one, or finishing after teardown, is discarded.

use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use switchboard_config::SwitchboardConfig;
use switchboard_rbac::{
    has_permission, Permission, PermissionScope, PermissionSet, ResourceRef, Tenant, TenantId,
};

use crate::credential::Credential;
use crate::error::{AuthorizationError, IdentityResult, SessionError, SessionResult};
use crate::http::{HttpIdentityProvider, HttpTenantService};
use crate::provider::{IdentityProvider, TenantService};
use crate::session::{Operation, Session, SessionSnapshot, SessionState};
use crate::store::CredentialStores;
use crate::wire::{normalize_permissions, LoginResponse, RawPermission, SwitchTenantResponse};

/// Proof that an operation started, checked again when it completes
#[derive(Debug, Clone, Copy)]
struct Ticket {
    operation: Operation,
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    session: Option<Arc<Session>>,
    generations: [u64; 4],
    in_flight: [bool; 4],
    torn_down: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
            session: None,
            generations: [0; 4],
            in_flight: [false; 4],
            torn_down: false,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            session: self.session.clone(),
            pending: self.pending(),
        }
    }

    fn pending(&self) -> Option<Operation> {
        [Operation::Login, Operation::Switch, Operation::Hydrate, Operation::Refresh]
            .into_iter()
            .find(|op| self.in_flight[op.index()])
    }

    fn is_current(&self, ticket: Ticket) -> bool {
        self.generations[ticket.operation.index()] == ticket.generation
    }

    /// Invalidate every in-flight call
    fn bump_all(&mut self) {
        for op in Operation::ALL {
            self.generations[op.index()] += 1;
            self.in_flight[op.index()] = false;
        }
    }

    /// Leave a transitional state once nothing in flight owns it
    fn settle(&mut self) {
        let owner_done = match self.state {
            SessionState::Initializing => !self.in_flight[Operation::Hydrate.index()],
            SessionState::Switching => !self.in_flight[Operation::Switch.index()],
            SessionState::TenantActive => self.session.is_none(),
            SessionState::Uninitialized | SessionState::Unauthenticated => false,
        };
        if owner_done {
            self.state = if self.session.is_some() {
                SessionState::TenantActive
            } else {
                SessionState::Unauthenticated
            };
        }
    }

    fn clear(&mut self) -> Option<Arc<Session>> {
        let previous = self.session.take();
        self.bump_all();
        self.state = SessionState::Unauthenticated;
        previous
    }
}

/// The single owner of the authenticated session
pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    tenants: Arc<dyn TenantService>,
    stores: CredentialStores,
    inner: Mutex<Inner>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        tenants: Arc<dyn TenantService>,
        stores: CredentialStores,
    ) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::uninitialized());
        Self {
            provider,
            tenants,
            stores,
            inner: Mutex::new(Inner::new()),
            snapshots,
        }
    }

    /// HTTP services and stores built from configuration
    pub fn from_config(config: &SwitchboardConfig) -> SessionResult<Self> {
        let provider = Arc::new(HttpIdentityProvider::new(config.identity.clone())?);
        let tenants = Arc::new(HttpTenantService::new(config.identity.clone())?);
        let stores = CredentialStores::from_config(config.session.clone());
        Ok(Self::new(provider, tenants, stores))
    }

    /// The tenant management service this manager authenticates against
    pub fn tenant_service(&self) -> Arc<dyn TenantService> {
        self.tenants.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().snapshot()
    }

    /// Receiver that observes every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn current_credential(&self) -> Option<Credential> {
        self.inner.lock().session.as_ref().map(|s| s.credential.clone())
    }

    fn publish(&self, inner: &Inner) {
        self.snapshots.send_replace(inner.snapshot());
    }

    fn begin(&self, operation: Operation) -> SessionResult<Ticket> {
        let mut inner = self.inner.lock();
        self.begin_locked(&mut inner, operation)
    }

    fn begin_locked(&self, inner: &mut Inner, operation: Operation) -> SessionResult<Ticket> {
        if inner.torn_down {
            return Err(SessionError::TornDown);
        }
        if matches!(operation, Operation::Switch | Operation::Refresh) && inner.session.is_none() {
            return Err(SessionError::NotAuthenticated);
        }
        if let Some(newer) = operation.yields_to().iter().find(|op| inner.in_flight[op.index()]) {
            debug!(operation = %operation, in_flight = %newer, "Session operation yields to a call in flight");
            return Err(SessionError::Superseded { operation });
        }

        for superseded in operation.supersedes() {
            inner.generations[superseded.index()] += 1;
            inner.in_flight[superseded.index()] = false;
        }
        inner.in_flight[operation.index()] = true;
        match operation {
            Operation::Hydrate => inner.state = SessionState::Initializing,
            Operation::Switch => inner.state = SessionState::Switching,
            Operation::Login | Operation::Refresh => {}
        }
        // A superseded switch or hydrate may have left a transitional state behind
        inner.settle();
        self.publish(inner);

        debug!(operation = %operation, "Session operation started");
        Ok(Ticket {
            operation,
            generation: inner.generations[operation.index()],
        })
    }

    fn check_ticket(inner: &Inner, ticket: Ticket) -> SessionResult<()> {
        if inner.torn_down {
            return Err(SessionError::TornDown);
        }
        if !inner.is_current(ticket) {
            return Err(SessionError::Superseded {
                operation: ticket.operation,
            });
        }
        Ok(())
    }

    /// Apply a completed call's result if it is still current
    fn commit<T>(
        &self,
        ticket: Ticket,
        apply: impl FnOnce(&mut Inner) -> SessionResult<T>,
    ) -> SessionResult<T> {
        let mut inner = self.inner.lock();
        if let Err(err) = Self::check_ticket(&inner, ticket) {
            debug!(operation = %ticket.operation, "Discarding stale session result");
            return Err(err);
        }

        inner.in_flight[ticket.operation.index()] = false;
        let result = apply(&mut *inner);
        inner.settle();
        self.publish(&inner);
        result
    }

    /// Finish a failed call without applying anything
    fn abort(&self, ticket: Ticket) {
        let mut inner = self.inner.lock();
        if inner.torn_down || !inner.is_current(ticket) {
            return;
        }
        inner.in_flight[ticket.operation.index()] = false;
        inner.settle();
        self.publish(&inner);
    }

    fn purge_stores(&self) {
        if let Err(err) = self.stores.purge() {
            warn!(error = %err, "Failed to purge credential stores");
        }
    }

    /// Hydrate from the persisted credential, if any.
    ///
    /// A rejected credential is purged and the manager lands unauthenticated
    /// with `Ok`. Connectivity failures are returned and leave the persisted
    /// credential in place. A login already in flight wins: hydration then
    /// fails with `Superseded` without touching anything.
    pub async fn initialize(&self) -> SessionResult<SessionSnapshot> {
        let ticket = {
            let mut inner = self.inner.lock();
            if inner.state.is_authenticated() {
                return Ok(inner.snapshot());
            }
            self.begin_locked(&mut inner, Operation::Hydrate)?
        };
        let persisted = match self.stores.load() {
            Ok(persisted) => persisted,
            Err(err) => {
                self.abort(ticket);
                return Err(err.into());
            }
        };

        let Some(credential) = persisted else {
            return self.commit(ticket, |inner| {
                // A cookie without persisted storage is stale
                self.stores.purge()?;
                inner.session = None;
                inner.state = SessionState::Unauthenticated;
                debug!("No persisted credential");
                Ok(inner.snapshot())
            });
        };

        debug!(tenant_id = %credential.tenant_id, "Hydrating session from persisted credential");
        let response = self.provider.current_session(&credential).await;
        let session = response
            .map_err(SessionError::from)
            .and_then(build_session);

        match session {
            Ok(session) => self.commit(ticket, |inner| {
                if session.credential != credential {
                    self.stores.replace(&session.credential, Some(&credential))?;
                }
                info!(
                    user_id = %session.identity.id,
                    tenant_id = %session.active_tenant.id,
                    "Session restored"
                );
                inner.session = Some(Arc::new(session));
                inner.state = SessionState::TenantActive;
                Ok(inner.snapshot())
            }),
            Err(SessionError::Identity(err)) if !err.is_auth_failure() => {
                let outcome: SessionResult<()> = self.commit(ticket, |inner| {
                    inner.session = None;
                    inner.state = SessionState::Unauthenticated;
                    Ok(())
                });
                outcome?;
                warn!(error = %err, "Session hydration failed, keeping persisted credential");
                Err(err.into())
            }
            Err(err) => {
                let snapshot = self.commit(ticket, |inner| {
                    warn!(error = %err, "Persisted credential unusable, purging");
                    inner.session = None;
                    inner.state = SessionState::Unauthenticated;
                    self.stores.purge()?;
                    Ok(inner.snapshot())
                })?;
                match err {
                    SessionError::Identity(_) => Ok(snapshot),
                    other => Err(other),
                }
            }
        }
    }

    /// Authenticate and install a new session.
    ///
    /// The stores are written before the session is installed; if either write
    /// fails nothing changes.
    pub async fn login(&self, principal: &str, secret: SecretString) -> SessionResult<SessionSnapshot> {
        let ticket = self.begin(Operation::Login)?;
        let session = match self.provider.login(principal, &secret).await {
            Ok(response) => build_session(response),
            Err(err) => Err(err.into()),
        };
        let session = match session {
            Ok(session) => session,
            Err(err) => {
                warn!(principal = %principal, error = %err, "Login failed");
                self.abort(ticket);
                return Err(err);
            }
        };

        self.commit(ticket, |inner| {
            let previous = inner.session.as_ref().map(|s| s.credential.clone());
            self.stores.replace(&session.credential, previous.as_ref())?;
            info!(
                user_id = %session.identity.id,
                tenant_id = %session.active_tenant.id,
                "User logged in"
            );
            inner.session = Some(Arc::new(session));
            inner.state = SessionState::TenantActive;
            Ok(inner.snapshot())
        })
    }

    /// Clear the session locally, then tell the provider.
    ///
    /// Never fails; calling it again is a no-op apart from another purge.
    pub async fn logout(&self) -> SessionSnapshot {
        let (previous, snapshot) = {
            let mut inner = self.inner.lock();
            let previous = inner.clear();
            self.purge_stores();
            self.publish(&inner);
            (previous, inner.snapshot())
        };

        if let Some(session) = previous {
            info!(user_id = %session.identity.id, "User logged out");
            if let Err(err) = self.provider.logout(&session.credential).await {
                warn!(error = %err, "Identity provider logout failed; session already cleared locally");
            }
        }
        snapshot
    }

    /// Act as another tenant.
    ///
    /// Allowed for tenants listed as available and for system roles. A denied
    /// target fails before anything is touched.
    pub async fn switch_tenant(&self, target: &TenantId) -> SessionResult<SessionSnapshot> {
        let current = self.require_session()?;
        if !current.can_access_tenant(target) {
            warn!(user_id = %current.identity.id, tenant_id = %target, "Tenant switch denied");
            return Err(AuthorizationError::TenantSwitchDenied {
                tenant_id: target.to_string(),
            }
            .into());
        }
        if &current.active_tenant.id == target {
            return Ok(self.snapshot());
        }

        let ticket = self.begin(Operation::Switch)?;
        let response = match self.tenants.switch_tenant(&current.credential, target).await {
            Ok(response) => response,
            Err(err) => {
                self.abort(ticket);
                if err.is_unauthorized() {
                    self.invalidate(Some(&current.credential));
                }
                return Err(err.into());
            }
        };
        let switched = match switched_parts(response, target) {
            Ok(parts) => parts,
            Err(err) => {
                self.abort(ticket);
                return Err(err);
            }
        };

        self.commit(ticket, |inner| {
            let base = inner.session.clone().ok_or(SessionError::NotAuthenticated)?;
            let next = switched.into_session(&base);
            self.stores.replace(&next.credential, Some(&base.credential))?;
            info!(
                user_id = %next.identity.id,
                tenant_id = %next.active_tenant.id,
                path = %next.tenant_path_display(),
                "Switched tenant"
            );
            inner.session = Some(Arc::new(next));
            inner.state = SessionState::TenantActive;
            Ok(inner.snapshot())
        })
    }

    /// Reissue the credential for the active tenant.
    ///
    /// A rejected refresh invalidates the session.
    pub async fn refresh_credential(&self) -> SessionResult<Credential> {
        let current = self.require_session()?;
        let ticket = self.begin(Operation::Refresh)?;

        let token = match self.provider.refresh(&current.credential).await {
            Ok(token) => token,
            Err(err) => {
                self.abort(ticket);
                if err.is_auth_failure() {
                    self.invalidate(Some(&current.credential));
                }
                return Err(err.into());
            }
        };

        self.commit(ticket, |inner| {
            let base = inner.session.clone().ok_or(SessionError::NotAuthenticated)?;
            let credential = Credential::new(token, base.active_tenant.id.clone());
            self.stores.replace(&credential, Some(&base.credential))?;

            let mut next = (*base).clone();
            next.credential = credential.clone();
            inner.session = Some(Arc::new(next));
            debug!(tenant_id = %credential.tenant_id, "Credential refreshed");
            Ok(credential)
        })
    }

    /// The 401 path: purge everything and drop to unauthenticated
    pub fn handle_unauthorized(&self) -> SessionSnapshot {
        self.invalidate(None);
        self.snapshot()
    }

    /// Drop the session if it still holds `rejected` (any session when `None`).
    ///
    /// Returns whether anything was invalidated.
    fn invalidate(&self, rejected: Option<&Credential>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(rejected) = rejected {
            let holds = inner.session.as_ref().is_some_and(|s| &s.credential == rejected);
            if !holds {
                debug!("Ignoring rejection of a credential that is no longer current");
                return false;
            }
        }

        let previous = inner.clear();
        self.purge_stores();
        self.publish(&inner);
        if let Some(session) = previous {
            warn!(user_id = %session.identity.id, "Credential rejected, session cleared");
        }
        true
    }

    /// Run an authenticated call with the current credential.
    ///
    /// A 401-class failure invalidates the session before the error is returned.
    pub async fn authorized<T, F, Fut>(&self, call: F) -> SessionResult<T>
    where
        F: FnOnce(Credential) -> Fut,
        Fut: Future<Output = IdentityResult<T>>,
    {
        let credential = self.current_credential().ok_or(SessionError::NotAuthenticated)?;
        match call(credential.clone()).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_unauthorized() {
                    self.invalidate(Some(&credential));
                }
                Err(err.into())
            }
        }
    }

    /// Discard every in-flight result from now on
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        inner.torn_down = true;
        inner.bump_all();
        inner.settle();
        self.publish(&inner);
        debug!("Session manager torn down");
    }

    pub fn has_permission(&self, resource: &str, action: &str, scope: Option<PermissionScope>) -> bool {
        let snapshot = self.snapshot();
        match snapshot.session.as_deref() {
            Some(session) if snapshot.state.is_authenticated() => {
                has_permission(&session.permissions, session.role_level(), resource, action, scope)
            }
            _ => false,
        }
    }

    /// Scope-aware check against a concrete resource
    pub fn can(&self, resource: &str, action: &str, target: &ResourceRef<'_>) -> bool {
        let snapshot = self.snapshot();
        match snapshot.session.as_deref() {
            Some(session) if snapshot.state.is_authenticated() => {
                session.checker().can(&session.scope_context(), resource, action, target)
            }
            _ => false,
        }
    }

    /// Fold tenants changed elsewhere into the session's copies.
    ///
    /// Only tenants the session already knows are touched.
    pub fn apply_tenant_updates(&self, updated: &[Tenant]) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        let Some(current) = inner.session.clone() else {
            return Ok(());
        };

        let mut next = (*current).clone();
        for tenant in updated {
            if tenant.id == next.active_tenant.id {
                next.tenant_path = switchboard_rbac::path(tenant)?;
                next.active_tenant = tenant.clone();
            }
            for known in next.available_tenants.iter_mut().filter(|t| t.id == tenant.id) {
                *known = tenant.clone();
            }
        }

        if next != *current {
            inner.session = Some(Arc::new(next));
            self.publish(&inner);
        }
        Ok(())
    }

    /// Forget tenants deleted elsewhere. The active tenant is kept.
    pub fn forget_tenants(&self, removed: &[TenantId]) {
        let mut inner = self.inner.lock();
        let Some(current) = inner.session.clone() else {
            return;
        };
        let mut next = (*current).clone();
        let active = next.active_tenant.id.clone();
        next.available_tenants
            .retain(|t| t.id == active || !removed.contains(&t.id));
        if next.available_tenants.len() != current.available_tenants.len() {
            inner.session = Some(Arc::new(next));
            self.publish(&inner);
        }
    }

    fn require_session(&self) -> SessionResult<Arc<Session>> {
        let inner = self.inner.lock();
        match &inner.session {
            Some(session) if inner.state.is_authenticated() => Ok(session.clone()),
            _ => Err(SessionError::NotAuthenticated),
        }
    }
}

/// Effective grants: the payload's permissions plus the role's own
fn effective_permissions(payload: &[RawPermission], role_permissions: &[Permission]) -> SessionResult<PermissionSet> {
    let mut permissions = PermissionSet::new(normalize_permissions(payload)?);
    permissions.extend(role_permissions.iter().cloned());
    Ok(permissions)
}

/// Normalise a provider payload into a complete session
fn build_session(response: LoginResponse) -> SessionResult<Session> {
    let identity = response.user.normalize(&response.tenant.id)?;
    let permissions = effective_permissions(&response.permissions, &identity.role.permissions)?;
    let tenant_path = switchboard_rbac::path(&response.tenant)?;

    let mut available_tenants: Vec<Tenant> = Vec::with_capacity(response.available_tenants.len() + 1);
    for tenant in response
        .available_tenants
        .into_iter()
        .chain(std::iter::once(response.tenant.clone()))
    {
        if !available_tenants.iter().any(|t| t.id == tenant.id) {
            available_tenants.push(tenant);
        }
    }

    Ok(Session {
        credential: Credential::new(response.token, response.tenant.id.clone()),
        identity,
        active_tenant: response.tenant,
        permissions,
        available_tenants,
        tenant_path,
        established_at: Utc::now(),
    })
}

/// The parts of a switch response, validated before the apply step
struct Switched {
    tenant: Tenant,
    tenant_path: Vec<TenantId>,
    payload: Vec<Permission>,
    credential: Credential,
}

fn switched_parts(response: SwitchTenantResponse, target: &TenantId) -> SessionResult<Switched> {
    if &response.tenant.id != target {
        return Err(SessionError::invalid_payload(format!(
            "switch to {} answered with tenant {}",
            target, response.tenant.id
        )));
    }
    Ok(Switched {
        tenant_path: switchboard_rbac::path(&response.tenant)?,
        payload: normalize_permissions(&response.permissions)?,
        credential: Credential::new(response.token, response.tenant.id.clone()),
        tenant: response.tenant,
    })
}

impl Switched {
    /// Replace tenant, grants and path of `base` as one unit
    fn into_session(self, base: &Session) -> Session {
        let mut permissions = PermissionSet::new(self.payload);
        permissions.extend(base.identity.role.permissions.iter().cloned());

        let mut available_tenants = base.available_tenants.clone();
        if !available_tenants.iter().any(|t| t.id == self.tenant.id) {
            available_tenants.push(self.tenant.clone());
        }

        Session {
            identity: base.identity.clone(),
            active_tenant: self.tenant,
            permissions,
            available_tenants,
            tenant_path: self.tenant_path,
            credential: self.credential,
            established_at: base.established_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IdentityError;
    use crate::testing::{secret, Call, Harness};
    use std::time::Duration;
    use switchboard_rbac::UserId;

    #[tokio::test]
    async fn test_login_installs_session_and_stores() {
        let h = Harness::acme();
        let snapshot = h.login("alice@acme.test", "alice-pw").await.unwrap();

        assert_eq!(snapshot.state, SessionState::TenantActive);
        let session = snapshot.session.unwrap();
        assert_eq!(session.active_tenant.id, TenantId::from("emea"));
        assert_eq!(session.tenant_path, vec![TenantId::from("acme"), TenantId::from("emea")]);
        assert_eq!(h.persisted("current_tenant_id").as_deref(), Some("emea"));
        assert_eq!(
            h.persisted("auth_token").as_deref(),
            Some(session.credential.token.expose())
        );
        assert!(!h.cookies.is_empty());
    }

    #[tokio::test]
    async fn test_permissions_are_union_of_payload_and_role() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        assert!(h.manager.has_permission("agents", "read", None));
        assert!(h.manager.has_permission("documents", "delete", None));
        assert!(h.manager.has_permission("tenants", "update", Some(PermissionScope::Subtenant)));
        assert!(!h.manager.has_permission("tenants", "delete", None));
    }

    #[tokio::test]
    async fn test_failed_login_touches_nothing() {
        let h = Harness::acme();
        let err = h.login("alice@acme.test", "wrong").await.unwrap_err();

        assert!(matches!(err, SessionError::Identity(IdentityError::InvalidCredentials)));
        assert_eq!(h.store_writes(), 0);
        assert!(!h.manager.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_initialize_without_credential() {
        let h = Harness::acme();
        let snapshot = h.manager.initialize().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Unauthenticated);
        assert_eq!(h.backend.call_count(Call::CurrentSession), 0);
    }

    #[tokio::test]
    async fn test_initialize_with_rejected_credential_purges() {
        let h = Harness::acme();
        h.login("bob@acme.test", "bob-pw").await.unwrap();
        h.backend.revoke_all();

        let restarted = Harness::with_storage(h.backend.clone(), h.storage.clone());
        let snapshot = restarted.manager.initialize().await.unwrap();

        assert_eq!(snapshot.state, SessionState::Unauthenticated);
        assert!(restarted.storage.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_connectivity_failure_keeps_credential() {
        let h = Harness::acme();
        h.login("bob@acme.test", "bob-pw").await.unwrap();

        let restarted = Harness::with_storage(h.backend.clone(), h.storage.clone());
        h.backend.fail_next(Call::CurrentSession, IdentityError::ServiceUnavailable);
        let err = restarted.manager.initialize().await.unwrap_err();

        assert!(err.is_connectivity());
        assert_eq!(restarted.manager.snapshot().state, SessionState::Unauthenticated);
        assert!(!restarted.storage.is_empty());
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        let first = h.manager.logout().await;
        let second = h.manager.logout().await;

        assert_eq!(first.state, SessionState::Unauthenticated);
        assert_eq!(second.state, SessionState::Unauthenticated);
        assert!(h.stores_empty());
        assert_eq!(h.backend.call_count(Call::Logout), 1);
    }

    #[tokio::test]
    async fn test_logout_survives_provider_failure() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();
        h.backend.fail_next(Call::Logout, IdentityError::Network("down".into()));

        let snapshot = h.manager.logout().await;
        assert!(!snapshot.is_authenticated());
        assert!(h.stores_empty());
    }

    #[tokio::test]
    async fn test_switch_replaces_tenant_as_one_unit() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();
        let before = h.manager.current_credential().unwrap();

        let snapshot = h.manager.switch_tenant(&TenantId::from("fr")).await.unwrap();
        let session = snapshot.session.unwrap();

        assert_eq!(snapshot.state, SessionState::TenantActive);
        assert_eq!(session.active_tenant.id, TenantId::from("fr"));
        assert_eq!(session.tenant_path.len(), 3);
        assert_ne!(session.credential, before);
        assert_eq!(h.persisted("current_tenant_id").as_deref(), Some("fr"));
        assert_eq!(session.identity.id, UserId::from("u-alice"));
    }

    #[tokio::test]
    async fn test_denied_switch_has_no_effect() {
        let h = Harness::acme();
        h.login("bob@acme.test", "bob-pw").await.unwrap();
        let before = h.manager.snapshot();
        let writes = h.store_writes();

        let err = h.manager.switch_tenant(&TenantId::from("apac")).await.unwrap_err();

        assert!(matches!(
            err,
            SessionError::Authorization(AuthorizationError::TenantSwitchDenied { .. })
        ));
        assert_eq!(h.store_writes(), writes);
        assert_eq!(h.manager.snapshot().session, before.session);
        assert_eq!(h.backend.call_count(Call::SwitchTenant), 0);
    }

    #[tokio::test]
    async fn test_system_role_may_enter_any_tenant() {
        let h = Harness::acme();
        h.login("admin@acme.test", "admin-pw").await.unwrap();

        let snapshot = h.manager.switch_tenant(&TenantId::from("apac")).await.unwrap();
        let session = snapshot.session.unwrap();
        assert_eq!(session.active_tenant.id, TenantId::from("apac"));
        assert!(session.available_tenants.iter().any(|t| t.id == TenantId::from("apac")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_switch_is_discarded() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();
        h.manager.switch_tenant(&TenantId::from("fr")).await.unwrap();

        h.backend.delay_next(Call::SwitchTenant, Duration::from_millis(200));
        let slow = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.switch_tenant(&TenantId::from("emea")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(h.manager.snapshot().state, SessionState::Switching);
        assert_eq!(h.manager.snapshot().pending, Some(Operation::Switch));

        // Alice may not enter apac, so use a fresh login to supersede the switch
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        let err = slow.await.unwrap().unwrap_err();
        assert!(err.is_superseded());
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.state, SessionState::TenantActive);
        assert_eq!(snapshot.active_tenant().unwrap().id, TenantId::from("emea"));
        assert_eq!(snapshot.pending, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_switch_wins() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        h.backend.delay_next(Call::SwitchTenant, Duration::from_millis(200));
        let first = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.switch_tenant(&TenantId::from("fr")).await })
        };
        tokio::task::yield_now().await;

        // Same target again; the newer call wins
        let second = h.manager.switch_tenant(&TenantId::from("fr")).await.unwrap();
        let fast_credential = second.credential().unwrap().clone();

        assert!(first.await.unwrap().unwrap_err().is_superseded());
        assert_eq!(h.manager.current_credential(), Some(fast_credential.clone()));
        assert_eq!(
            h.persisted("auth_token").as_deref(),
            Some(fast_credential.token.expose())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_discards_late_login() {
        let h = Harness::acme();
        h.backend.delay_next(Call::Login, Duration::from_millis(100));
        let pending = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.login("alice@acme.test", secret("alice-pw")).await })
        };
        tokio::task::yield_now().await;

        h.manager.teardown();
        let err = pending.await.unwrap().unwrap_err();

        assert!(matches!(err, SessionError::TornDown));
        assert!(h.stores_empty());
        assert!(!h.manager.snapshot().is_authenticated());
        assert!(matches!(h.manager.initialize().await, Err(SessionError::TornDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_yields_to_login_in_flight() {
        let backend = Arc::new(crate::testing::MockBackend::acme());
        let storage = Arc::new(crate::store::MemoryTokenStorage::new());
        Harness::with_storage(backend.clone(), storage.clone())
            .login("bob@acme.test", "bob-pw")
            .await
            .unwrap();

        let h = Harness::with_storage(backend, storage);
        h.backend.delay_next(Call::Login, Duration::from_millis(300));
        let login = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.login("alice@acme.test", secret("alice-pw")).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(h.manager.snapshot().pending, Some(Operation::Login));

        let err = h.manager.initialize().await.unwrap_err();
        assert!(err.is_superseded());
        assert_eq!(h.backend.call_count(Call::CurrentSession), 0);

        login.await.unwrap().unwrap();
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.identity().unwrap().id, UserId::new("u-alice"));
        assert_eq!(h.persisted("current_tenant_id").as_deref(), Some("emea"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_wins_over_slow_hydration() {
        let backend = Arc::new(crate::testing::MockBackend::acme());
        let storage = Arc::new(crate::store::MemoryTokenStorage::new());
        Harness::with_storage(backend.clone(), storage.clone())
            .login("bob@acme.test", "bob-pw")
            .await
            .unwrap();

        let h = Harness::with_storage(backend, storage);
        h.backend.delay_next(Call::CurrentSession, Duration::from_millis(300));
        let hydrate = {
            let manager = h.manager.clone();
            tokio::spawn(async move { manager.initialize().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(h.manager.snapshot().state, SessionState::Initializing);

        h.login("alice@acme.test", "alice-pw").await.unwrap();

        assert!(hydrate.await.unwrap().unwrap_err().is_superseded());
        let snapshot = h.manager.snapshot();
        assert_eq!(snapshot.state, SessionState::TenantActive);
        assert_eq!(snapshot.identity().unwrap().id, UserId::new("u-alice"));
        assert_eq!(h.persisted("current_tenant_id").as_deref(), Some("emea"));
    }

    #[tokio::test]
    async fn test_refresh_reissues_into_every_store() {
        let h = Harness::acme();
        h.login("bob@acme.test", "bob-pw").await.unwrap();
        let old = h.manager.current_credential().unwrap();

        let fresh = h.manager.refresh_credential().await.unwrap();

        assert_ne!(fresh.token, old.token);
        assert_eq!(fresh.tenant_id, old.tenant_id);
        assert_eq!(h.persisted("auth_token").as_deref(), Some(fresh.token.expose()));
        assert!(!h.backend.is_live(old.token.expose()));
    }

    #[tokio::test]
    async fn test_rejected_refresh_purges() {
        let h = Harness::acme();
        h.login("bob@acme.test", "bob-pw").await.unwrap();
        h.backend.revoke_all();

        let err = h.manager.refresh_credential().await.unwrap_err();
        assert!(err.is_unauthorized());
        assert!(h.stores_empty());
        assert_eq!(h.manager.snapshot().state, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_authorized_401_purges() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        let result: SessionResult<()> = h
            .manager
            .authorized(|_credential| async { Err(IdentityError::Unauthorized) })
            .await;

        assert!(result.unwrap_err().is_unauthorized());
        assert!(h.stores_empty());
        assert!(!h.manager.has_permission("agents", "read", None));
    }

    #[tokio::test]
    async fn test_authorized_passes_other_errors_through() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        let result: SessionResult<()> = h
            .manager
            .authorized(|_credential| async { Err(IdentityError::Forbidden("agents".into())) })
            .await;

        assert!(result.is_err());
        assert!(h.manager.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_stale_rejection_ignored_after_new_login() {
        let h = Harness::acme();
        h.login("alice@acme.test", "alice-pw").await.unwrap();
        let stale = h.manager.current_credential().unwrap();
        h.login("alice@acme.test", "alice-pw").await.unwrap();

        assert!(!h.manager.invalidate(Some(&stale)));
        assert!(h.manager.snapshot().is_authenticated());
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let h = Harness::acme();
        let mut rx = h.manager.subscribe();

        h.login("alice@acme.test", "alice-pw").await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_authenticated());

        h.manager.handle_unauthorized();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().state, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_unauthenticated_has_no_permissions() {
        let h = Harness::acme();
        assert!(!h.manager.has_permission("agents", "read", None));
        assert!(matches!(
            h.manager.switch_tenant(&TenantId::from("emea")).await,
            Err(SessionError::NotAuthenticated)
        ));
    }
}

//! In-memory identity provider and tenant service for tests
//!
//! [`MockBackend`] implements both service traits over a server-side
//! [`TenantHierarchy`]. Failures and delays can be queued per call kind, and
//! every call is recorded.

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use switchboard_config::SessionConfig;
use switchboard_rbac::{RoleLevel, Tenant, TenantHierarchy, TenantId, UserId};

use crate::credential::{BearerToken, Credential};
use crate::error::{IdentityError, IdentityResult, SessionResult};
use crate::manager::SessionManager;
use crate::provider::{IdentityProvider, TenantService};
use crate::session::SessionSnapshot;
use crate::store::{CredentialStores, MemoryCookieJar, MemoryTokenStorage};
use crate::wire::{
    CreateTenantRequest, LoginResponse, RawIdentity, RawPermission, RawRole, SwitchTenantResponse, TenantPatch,
};

/// Kinds of backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Login,
    CurrentSession,
    Refresh,
    Logout,
    SwitchTenant,
    CreateTenant,
    UpdateTenant,
    DeleteTenant,
    MoveTenant,
    ListSubTenants,
    Hierarchy,
}

/// A principal known to the backend
#[derive(Debug, Clone)]
pub struct Account {
    pub password: String,
    pub user: RawIdentity,
    /// Extra grants sent alongside the role's own
    pub permissions: Vec<RawPermission>,
    pub available_tenants: Vec<TenantId>,
}

impl Account {
    pub fn new(id: &str, email: &str, role: RawRole, home_tenant: &str, password: &str) -> Self {
        Self {
            password: password.to_string(),
            user: RawIdentity {
                id: UserId::new(id),
                email: email.to_string(),
                display_name: None,
                avatar_url: None,
                role,
                home_tenant_id: Some(TenantId::new(home_tenant)),
            },
            permissions: Vec::new(),
            available_tenants: vec![TenantId::new(home_tenant)],
        }
    }

    pub fn with_permissions(mut self, slugs: &[&str]) -> Self {
        self.permissions = slugs.iter().map(|s| RawPermission::slug(*s)).collect();
        self
    }

    pub fn with_available(mut self, tenants: &[&str]) -> Self {
        self.available_tenants = tenants.iter().map(|t| TenantId::new(*t)).collect();
        self
    }
}

/// Build a role payload from permission slugs
pub fn role(name: &str, level: RoleLevel, slugs: &[&str]) -> RawRole {
    RawRole {
        name: name.to_string(),
        display_name: None,
        level,
        permissions: slugs.iter().map(|s| RawPermission::slug(*s)).collect(),
    }
}

#[derive(Debug, Default)]
struct BackendState {
    accounts: HashMap<String, Account>,
    tenants: TenantHierarchy,
    /// Live tokens mapped to the principal and tenant they were minted for
    tokens: HashMap<String, (String, TenantId)>,
    revoked: HashSet<String>,
    next_token: u64,
    next_tenant: u64,
    failures: VecDeque<(Call, IdentityError)>,
    delays: VecDeque<(Call, Duration)>,
    calls: Vec<Call>,
    /// Keep a refreshed token usable instead of revoking it
    refresh_grace: bool,
}

impl BackendState {
    fn mint(&mut self, principal: &str, tenant_id: &TenantId) -> BearerToken {
        self.next_token += 1;
        let token = format!("tok-{}-{}", self.next_token, tenant_id);
        self.tokens.insert(token.clone(), (principal.to_string(), tenant_id.clone()));
        BearerToken::new(token)
    }

    fn take_failure(&mut self, call: Call) -> Option<IdentityError> {
        let position = self.failures.iter().position(|(c, _)| *c == call)?;
        self.failures.remove(position).map(|(_, err)| err)
    }

    fn take_delay(&mut self, call: Call) -> Option<Duration> {
        let position = self.delays.iter().position(|(c, _)| *c == call)?;
        self.delays.remove(position).map(|(_, delay)| delay)
    }

    fn authenticate(&self, credential: &Credential) -> IdentityResult<(Account, TenantId)> {
        let token = credential.token.expose();
        if self.revoked.contains(token) {
            return Err(IdentityError::ExpiredCredential);
        }
        let (principal, tenant_id) = self.tokens.get(token).ok_or(IdentityError::Unauthorized)?;
        let account = self.accounts.get(principal).ok_or(IdentityError::Unauthorized)?;
        Ok((account.clone(), tenant_id.clone()))
    }

    fn tenant(&self, tenant_id: &TenantId) -> IdentityResult<Tenant> {
        self.tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(format!("tenant {}", tenant_id)))
    }

    fn session_payload(&self, account: &Account, token: BearerToken, tenant_id: &TenantId) -> IdentityResult<LoginResponse> {
        let tenant = self.tenant(tenant_id)?;
        if !tenant.is_active {
            return Err(IdentityError::TenantSuspended);
        }
        let available_tenants = account
            .available_tenants
            .iter()
            .filter_map(|id| self.tenants.get(id).cloned())
            .collect();
        Ok(LoginResponse {
            token,
            user: account.user.clone(),
            tenant,
            permissions: account.permissions.clone(),
            available_tenants,
        })
    }
}

fn rbac_to_service_error(err: switchboard_rbac::RbacError) -> IdentityError {
    if err.is_not_found() {
        IdentityError::NotFound(err.to_string())
    } else {
        IdentityError::Unexpected {
            status: 422,
            message: err.to_string(),
        }
    }
}

/// In-memory identity provider and tenant service
#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// acme (5) → {emea (2, full) → {fr, de}, apac (1)}, with three accounts:
    ///
    /// - `admin@acme.test` / `admin-pw`: system role, home acme
    /// - `alice@acme.test` / `alice-pw`: tenant admin of emea (subtenant
    ///   scope), may enter emea and fr
    /// - `bob@acme.test` / `bob-pw`: user role in fr
    pub fn acme() -> Self {
        let backend = Self::new();

        let acme = Tenant::root("acme", "Acme", 5);
        let emea = Tenant::child_of(&acme, "emea", "EMEA", 2);
        let apac = Tenant::child_of(&acme, "apac", "APAC", 1);
        let fr = Tenant::child_of(&emea, "fr", "France", 2);
        let de = Tenant::child_of(&emea, "de", "Germany", 2);
        {
            let mut state = backend.state.lock();
            let tenants = &mut state.tenants;
            let _ = tenants.insert(acme.clone());
            let _ = tenants.attach_child(&acme.id, emea.clone());
            let _ = tenants.attach_child(&acme.id, apac);
            let _ = tenants.attach_child(&emea.id, fr);
            let _ = tenants.attach_child(&emea.id, de);
        }

        backend.add_account(
            "admin@acme.test",
            Account::new("u-admin", "admin@acme.test", role("platform_admin", RoleLevel::System, &[]), "acme", "admin-pw"),
        );
        backend.add_account(
            "alice@acme.test",
            Account::new(
                "u-alice",
                "alice@acme.test",
                role(
                    "tenant_admin",
                    RoleLevel::Tenant,
                    &[
                        "tenants:read:subtenant",
                        "tenants:create:subtenant",
                        "tenants:update:subtenant",
                    ],
                ),
                "emea",
                "alice-pw",
            )
            .with_permissions(&["agents:read", "documents:*"])
            .with_available(&["emea", "fr"]),
        );
        backend.add_account(
            "bob@acme.test",
            Account::new("u-bob", "bob@acme.test", role("member", RoleLevel::User, &["agents:read:own"]), "fr", "bob-pw"),
        );
        backend
    }

    pub fn add_account(&self, principal: &str, account: Account) {
        self.state.lock().accounts.insert(principal.to_string(), account);
    }

    pub fn insert_tenant(&self, parent: Option<&TenantId>, tenant: Tenant) -> IdentityResult<()> {
        let mut state = self.state.lock();
        match parent {
            Some(parent_id) => state.tenants.attach_child(parent_id, tenant).map(|_| ()),
            None => state.tenants.insert(tenant),
        }
        .map_err(rbac_to_service_error)
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.state.lock().tenants.get(&TenantId::new(tenant_id)).cloned()
    }

    /// Make the next call of this kind fail
    pub fn fail_next(&self, call: Call, err: IdentityError) {
        self.state.lock().failures.push_back((call, err));
    }

    /// Make the next call of this kind wait before answering
    pub fn delay_next(&self, call: Call, delay: Duration) {
        self.state.lock().delays.push_back((call, delay));
    }

    /// Leave tokens live after they are refreshed, like a server with a grace period
    pub fn keep_refreshed_tokens(&self) {
        self.state.lock().refresh_grace = true;
    }

    /// Expire every token minted so far
    pub fn revoke_all(&self) {
        let mut state = self.state.lock();
        let tokens: Vec<String> = state.tokens.keys().cloned().collect();
        state.revoked.extend(tokens);
    }

    pub fn revoke(&self, token: &str) {
        self.state.lock().revoked.insert(token.to_string());
    }

    pub fn is_live(&self, token: &str) -> bool {
        let state = self.state.lock();
        state.tokens.contains_key(token) && !state.revoked.contains(token)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, call: Call) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Record the call, then apply its queued delay and failure
    async fn enter(&self, call: Call) -> IdentityResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.take_delay(call)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.lock().take_failure(call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl IdentityProvider for MockBackend {
    async fn login(&self, principal: &str, secret: &SecretString) -> IdentityResult<LoginResponse> {
        self.enter(Call::Login).await?;
        let mut state = self.state.lock();
        let account = state
            .accounts
            .get(principal)
            .filter(|a| a.password == *secret.expose_secret())
            .cloned()
            .ok_or(IdentityError::InvalidCredentials)?;
        let home = account
            .user
            .home_tenant_id
            .clone()
            .ok_or_else(|| IdentityError::InvalidResponse("account without home tenant".to_string()))?;
        if !state.tenant(&home)?.is_active {
            return Err(IdentityError::TenantSuspended);
        }
        let token = state.mint(principal, &home);
        state.session_payload(&account, token, &home)
    }

    async fn current_session(&self, credential: &Credential) -> IdentityResult<LoginResponse> {
        self.enter(Call::CurrentSession).await?;
        let state = self.state.lock();
        let (account, tenant_id) = state.authenticate(credential)?;
        state.session_payload(&account, credential.token.clone(), &tenant_id)
    }

    async fn refresh(&self, credential: &Credential) -> IdentityResult<BearerToken> {
        self.enter(Call::Refresh).await?;
        let mut state = self.state.lock();
        let (account, tenant_id) = state.authenticate(credential)?;
        if !state.refresh_grace {
            state.revoked.insert(credential.token.expose().to_string());
        }
        Ok(state.mint(&account.user.email, &tenant_id))
    }

    async fn logout(&self, credential: &Credential) -> IdentityResult<()> {
        self.enter(Call::Logout).await?;
        self.state.lock().tokens.remove(credential.token.expose());
        Ok(())
    }
}

#[async_trait]
impl TenantService for MockBackend {
    async fn switch_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
    ) -> IdentityResult<SwitchTenantResponse> {
        self.enter(Call::SwitchTenant).await?;
        let mut state = self.state.lock();
        let (account, _) = state.authenticate(credential)?;
        let allowed = account.user.role.level.is_system() || account.available_tenants.contains(tenant_id);
        if !allowed {
            return Err(IdentityError::Forbidden(format!("tenant {}", tenant_id)));
        }
        let tenant = state.tenant(tenant_id)?;
        let token = state.mint(&account.user.email, tenant_id);
        Ok(SwitchTenantResponse {
            token,
            tenant,
            permissions: account.permissions.clone(),
        })
    }

    async fn create_tenant(
        &self,
        credential: &Credential,
        request: &CreateTenantRequest,
    ) -> IdentityResult<Tenant> {
        self.enter(Call::CreateTenant).await?;
        let mut state = self.state.lock();
        state.authenticate(credential)?;

        let id = match &request.id {
            Some(id) => id.clone(),
            None => {
                state.next_tenant += 1;
                TenantId::new(format!("t-{}", state.next_tenant))
            }
        };
        let mut tenant = match &request.parent_tenant_id {
            Some(parent_id) => Tenant::child_of(&state.tenant(parent_id)?, id, request.name.as_str(), request.max_sub_tenants),
            None => Tenant::root(id, request.name.as_str(), request.max_sub_tenants),
        };
        tenant.plan = request.plan;
        tenant.settings = request.settings.clone();

        match &request.parent_tenant_id {
            Some(parent_id) => state.tenants.attach_child(parent_id, tenant).map_err(rbac_to_service_error),
            None => state
                .tenants
                .insert(tenant.clone())
                .map(|_| tenant)
                .map_err(rbac_to_service_error),
        }
    }

    async fn update_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        patch: &TenantPatch,
    ) -> IdentityResult<Tenant> {
        self.enter(Call::UpdateTenant).await?;
        let mut state = self.state.lock();
        state.authenticate(credential)?;
        let mut tenant = state.tenant(tenant_id)?;
        patch.apply_to(&mut tenant);
        state.tenants.update(tenant.clone()).map_err(rbac_to_service_error)?;
        Ok(tenant)
    }

    async fn delete_tenant(&self, credential: &Credential, tenant_id: &TenantId) -> IdentityResult<()> {
        self.enter(Call::DeleteTenant).await?;
        let mut state = self.state.lock();
        state.authenticate(credential)?;
        state.tenants.remove(tenant_id).map_err(rbac_to_service_error)?;
        Ok(())
    }

    async fn move_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        new_parent: Option<&TenantId>,
    ) -> IdentityResult<Vec<Tenant>> {
        self.enter(Call::MoveTenant).await?;
        let mut state = self.state.lock();
        state.authenticate(credential)?;
        let planned = state
            .tenants
            .plan_move(tenant_id, new_parent)
            .map_err(rbac_to_service_error)?;
        let subtree = planned.subtree.clone();
        state.tenants.apply_move(planned).map_err(rbac_to_service_error)?;
        Ok(subtree)
    }

    async fn list_sub_tenants(&self, credential: &Credential, tenant_id: &TenantId) -> IdentityResult<Vec<Tenant>> {
        self.enter(Call::ListSubTenants).await?;
        let state = self.state.lock();
        state.authenticate(credential)?;
        state.tenant(tenant_id)?;
        Ok(state.tenants.children(tenant_id).into_iter().cloned().collect())
    }

    async fn hierarchy(&self, credential: &Credential, root: &TenantId) -> IdentityResult<Vec<Tenant>> {
        self.enter(Call::Hierarchy).await?;
        let state = self.state.lock();
        state.authenticate(credential)?;
        let mut subtree = vec![state.tenant(root)?];
        subtree.extend(state.tenants.descendants(root).into_iter().cloned());
        Ok(subtree)
    }
}

/// A session manager wired to a backend and fresh in-memory stores
pub struct Harness {
    pub backend: Arc<MockBackend>,
    pub storage: Arc<MemoryTokenStorage>,
    pub cookies: Arc<MemoryCookieJar>,
    pub manager: Arc<SessionManager>,
}

impl Harness {
    pub fn new(backend: Arc<MockBackend>) -> Self {
        Self::with_storage(backend, Arc::new(MemoryTokenStorage::new()))
    }

    /// Share persisted storage with another harness, as a restarted process would
    pub fn with_storage(backend: Arc<MockBackend>, storage: Arc<MemoryTokenStorage>) -> Self {
        let cookies = Arc::new(MemoryCookieJar::new());
        let stores = CredentialStores::new(storage.clone(), cookies.clone(), SessionConfig::default());
        let manager = Arc::new(SessionManager::new(backend.clone(), backend.clone(), stores));
        Self {
            backend,
            storage,
            cookies,
            manager,
        }
    }

    pub fn acme() -> Self {
        Self::new(Arc::new(MockBackend::acme()))
    }

    /// Total writes across both stores
    pub fn store_writes(&self) -> usize {
        self.storage.write_count() + self.cookies.write_count()
    }

    /// Value held in persisted storage
    pub fn persisted(&self, key: &str) -> Option<String> {
        self.storage.entries().get(key).cloned()
    }

    pub fn stores_empty(&self) -> bool {
        self.storage.is_empty() && self.cookies.is_empty()
    }

    pub async fn login(&self, principal: &str, password: &str) -> SessionResult<SessionSnapshot> {
        self.manager.login(principal, secret(password)).await
    }
}

pub fn secret(value: &str) -> SecretString {
    SecretString::new(value.to_string())
}

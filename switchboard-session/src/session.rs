//! The session aggregate and the snapshots consumers observe

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use switchboard_rbac::{
    Identity, PermissionChecker, PermissionSet, RoleLevel, ScopeContext, Tenant, TenantId,
};

use crate::credential::Credential;

/// Lifecycle of the session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    /// Hydrating from a persisted credential
    Initializing,
    Unauthenticated,
    /// Authenticated and acting in the active tenant
    TenantActive,
    /// Authenticated; a tenant switch is in flight
    Switching,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::TenantActive | Self::Switching)
    }
}

/// Kinds of network-bound session operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Hydrate,
    Login,
    Switch,
    Refresh,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Hydrate,
        Operation::Login,
        Operation::Switch,
        Operation::Refresh,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            Operation::Hydrate => 0,
            Operation::Login => 1,
            Operation::Switch => 2,
            Operation::Refresh => 3,
        }
    }

    /// Operations whose in-flight results become stale when this one starts
    pub(crate) fn supersedes(self) -> &'static [Operation] {
        match self {
            Operation::Login => &Operation::ALL,
            Operation::Switch => &[Operation::Switch, Operation::Refresh],
            Operation::Hydrate => &[Operation::Hydrate],
            Operation::Refresh => &[Operation::Refresh],
        }
    }

    /// Operations that, while in flight, make this one refuse to start
    pub(crate) fn yields_to(self) -> &'static [Operation] {
        match self {
            Operation::Hydrate => &[Operation::Login],
            Operation::Login | Operation::Switch | Operation::Refresh => &[],
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Hydrate => "hydrate",
            Operation::Login => "login",
            Operation::Switch => "tenant switch",
            Operation::Refresh => "credential refresh",
        };
        f.write_str(name)
    }
}

/// Everything known about the authenticated caller
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub identity: Identity,
    pub active_tenant: Tenant,
    /// Effective grants: the login payload's permissions plus the role's
    pub permissions: PermissionSet,
    pub available_tenants: Vec<Tenant>,
    /// Ancestry of the active tenant, root first
    pub tenant_path: Vec<TenantId>,
    pub credential: Credential,
    pub established_at: DateTime<Utc>,
}

impl Session {
    pub fn role_level(&self) -> RoleLevel {
        self.identity.role_level()
    }

    pub fn checker(&self) -> PermissionChecker<'_> {
        PermissionChecker::new(&self.permissions, self.role_level())
    }

    pub fn scope_context(&self) -> ScopeContext<'_> {
        ScopeContext {
            caller_id: &self.identity.id,
            active_tenant: &self.active_tenant,
        }
    }

    /// System roles may enter any tenant; everyone else only listed ones
    pub fn can_access_tenant(&self, tenant_id: &TenantId) -> bool {
        self.role_level().is_system() || self.available_tenants.iter().any(|t| &t.id == tenant_id)
    }

    pub fn tenant_path_display(&self) -> String {
        self.tenant_path
            .iter()
            .map(TenantId::as_str)
            .collect::<Vec<_>>()
            .join(" / ")
    }
}

/// Immutable view of the manager published on every change
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session: Option<Arc<Session>>,
    /// Operation currently in flight, for pending indicators
    pub pending: Option<Operation>,
}

impl SessionSnapshot {
    pub(crate) fn uninitialized() -> Self {
        Self {
            state: SessionState::Uninitialized,
            session: None,
            pending: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.is_authenticated() && self.session.is_some()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.session.as_deref().map(|s| &s.identity)
    }

    pub fn active_tenant(&self) -> Option<&Tenant> {
        self.session.as_deref().map(|s| &s.active_tenant)
    }

    pub fn permissions(&self) -> Option<&PermissionSet> {
        self.session.as_deref().map(|s| &s.permissions)
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.session.as_deref().map(|s| &s.credential)
    }
}

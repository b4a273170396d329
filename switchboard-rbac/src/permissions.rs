//! Permission evaluation
//!
//! Grants are additive: a query is allowed when any permission in the set
//! matches, and denied otherwise. There is no deny rule.

use serde::{Deserialize, Serialize};

use crate::{
    error::{RbacError, RbacResult},
    models::{ActionType, Condition, Permission, PermissionScope, ResourceType, RoleLevel, Tenant, UserId},
    tenant::is_descendant_of,
};

/// The permissions held by a caller in the active tenant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet {
    permissions: Vec<Permission>,
}

impl PermissionSet {
    pub fn new(permissions: Vec<Permission>) -> Self {
        let mut set = Self::default();
        set.extend(permissions);
        set
    }

    /// Add permissions, skipping exact duplicates
    pub fn extend(&mut self, permissions: impl IntoIterator<Item = Permission>) {
        for permission in permissions {
            if !self.permissions.contains(&permission) {
                self.permissions.push(permission);
            }
        }
    }

    /// Union of two sets
    pub fn union(mut self, other: &PermissionSet) -> Self {
        self.extend(other.permissions.iter().cloned());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.permissions.iter()
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Permissions granting `resource`/`action` regardless of scope
    pub fn grants_for<'a>(
        &'a self,
        resource: &'a str,
        action: &'a str,
    ) -> impl Iterator<Item = &'a Permission> + 'a {
        self.permissions
            .iter()
            .filter(move |p| p.grants(resource, action))
    }
}

impl From<Vec<Permission>> for PermissionSet {
    fn from(permissions: Vec<Permission>) -> Self {
        Self::new(permissions)
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Decide whether a caller may perform `action` on `resource`.
///
/// System-level roles are allowed unconditionally. Everyone else needs a grant
/// whose resource and action match (or are `*`) and whose scope equals the
/// requested one or is `all`. An unspecified scope matches any grant.
pub fn has_permission(
    permissions: &PermissionSet,
    role_level: RoleLevel,
    resource: &str,
    action: &str,
    scope: Option<PermissionScope>,
) -> bool {
    if role_level.is_system() {
        return true;
    }
    permissions.iter().any(|p| p.matches(resource, action, scope))
}

/// Who is asking and where they currently act
#[derive(Debug, Clone, Copy)]
pub struct ScopeContext<'a> {
    pub caller_id: &'a UserId,
    pub active_tenant: &'a Tenant,
}

/// Ownership facts about the resource instance being accessed.
///
/// Filled in by the call site; the engine never looks ownership up itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceRef<'a> {
    pub owner_id: Option<&'a UserId>,
    pub tenant: Option<&'a Tenant>,
}

impl<'a> ResourceRef<'a> {
    pub fn owned_by(owner_id: &'a UserId) -> Self {
        Self {
            owner_id: Some(owner_id),
            tenant: None,
        }
    }

    pub fn in_tenant(tenant: &'a Tenant) -> Self {
        Self {
            owner_id: None,
            tenant: Some(tenant),
        }
    }

    pub fn with_owner(mut self, owner_id: &'a UserId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }
}

/// Whether a grant of breadth `scope` reaches the given resource instance
pub fn scope_satisfied(scope: PermissionScope, ctx: &ScopeContext<'_>, resource: &ResourceRef<'_>) -> bool {
    match scope {
        PermissionScope::All => true,
        PermissionScope::Own => resource.owner_id == Some(ctx.caller_id),
        PermissionScope::Tenant => resource
            .tenant
            .is_some_and(|tenant| tenant.id == ctx.active_tenant.id),
        PermissionScope::Subtenant => resource.tenant.is_some_and(|tenant| {
            tenant.id == ctx.active_tenant.id || is_descendant_of(tenant, ctx.active_tenant)
        }),
    }
}

/// Permission checks bound to one caller's permission set and role level
#[derive(Debug, Clone, Copy)]
pub struct PermissionChecker<'a> {
    permissions: &'a PermissionSet,
    role_level: RoleLevel,
}

impl<'a> PermissionChecker<'a> {
    pub fn new(permissions: &'a PermissionSet, role_level: RoleLevel) -> Self {
        Self {
            permissions,
            role_level,
        }
    }

    pub fn role_level(&self) -> RoleLevel {
        self.role_level
    }

    /// Resource/action/scope matching, see [`has_permission`]
    pub fn has_permission(&self, resource: &str, action: &str, scope: Option<PermissionScope>) -> bool {
        has_permission(self.permissions, self.role_level, resource, action, scope)
    }

    /// Typed variant of [`Self::has_permission`]
    pub fn check(&self, resource: ResourceType, action: ActionType, scope: Option<PermissionScope>) -> bool {
        self.has_permission(resource.as_str(), action.as_str(), scope)
    }

    /// Whether some grant both matches and reaches the resource instance
    pub fn can(&self, ctx: &ScopeContext<'_>, resource: &str, action: &str, target: &ResourceRef<'_>) -> bool {
        if self.role_level.is_system() {
            return true;
        }
        self.permissions
            .grants_for(resource, action)
            .any(|p| scope_satisfied(p.scope, ctx, target))
    }

    /// Like [`Self::can`] but fails with `PermissionDenied`
    pub fn require(
        &self,
        ctx: &ScopeContext<'_>,
        resource: &str,
        action: &str,
        target: &ResourceRef<'_>,
    ) -> RbacResult<()> {
        if self.can(ctx, resource, action, target) {
            return Ok(());
        }
        let tenant_id = target.tenant.unwrap_or(ctx.active_tenant).id.to_string();
        Err(RbacError::permission_denied(action, resource, tenant_id))
    }

    /// Conditions attached to the grants that reach the resource instance.
    ///
    /// Empty for system roles, which bypass conditions along with scope.
    pub fn matching_conditions(
        &self,
        ctx: &ScopeContext<'_>,
        resource: &str,
        action: &str,
        target: &ResourceRef<'_>,
    ) -> Vec<&'a Condition> {
        if self.role_level.is_system() {
            return Vec::new();
        }
        let permissions: &'a PermissionSet = self.permissions;
        permissions
            .permissions
            .iter()
            .filter(|p| p.grants(resource, action) && scope_satisfied(p.scope, ctx, target))
            .flat_map(|p| p.conditions.iter())
            .collect()
    }

    /// May the caller create children under `parent`
    pub fn can_create_tenant(&self, ctx: &ScopeContext<'_>, parent: &Tenant) -> bool {
        self.can_on_tenant(ctx, ActionType::Create, parent)
    }

    /// May the caller read `tenant` and list its children
    pub fn can_read_tenant(&self, ctx: &ScopeContext<'_>, tenant: &Tenant) -> bool {
        self.can_on_tenant(ctx, ActionType::Read, tenant)
    }

    pub fn can_update_tenant(&self, ctx: &ScopeContext<'_>, tenant: &Tenant) -> bool {
        self.can_on_tenant(ctx, ActionType::Update, tenant)
    }

    pub fn can_delete_tenant(&self, ctx: &ScopeContext<'_>, tenant: &Tenant) -> bool {
        self.can_on_tenant(ctx, ActionType::Delete, tenant)
    }

    fn can_on_tenant(&self, ctx: &ScopeContext<'_>, action: ActionType, tenant: &Tenant) -> bool {
        self.can(
            ctx,
            ResourceType::Tenant.as_str(),
            action.as_str(),
            &ResourceRef::in_tenant(tenant),
        )
    }
}

/// Return early with a permission-denied error unless the checker allows the
/// action. The error is converted with `.into()` so callers may use their own
/// error type.
#[macro_export]
macro_rules! require_permission {
    ($checker:expr, $ctx:expr, $resource:expr, $action:expr, $target:expr) => {{
        if let Err(err) = $checker.require($ctx, $resource.as_str(), $action.as_str(), $target) {
            return Err(err.into());
        }
    }};
}

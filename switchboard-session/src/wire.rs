//! Wire payloads of the identity provider and tenant service
//!
//! Permissions arrive either as slug strings (`"agents:read"`,
//! `"tenants:update:subtenant"`, `"*"`) or as structured objects. Everything is
//! normalised into [`Permission`] here, before it reaches the permission engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use switchboard_rbac::{
    Condition, Identity, Permission, PermissionScope, Role, RoleLevel, Tenant, TenantId, TenantPlan, UserId,
    WILDCARD,
};

use crate::credential::BearerToken;
use crate::error::{SessionError, SessionResult};

/// A permission in either wire representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPermission {
    Slug(String),
    Structured {
        resource: String,
        action: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        conditions: Vec<Condition>,
    },
}

impl RawPermission {
    pub fn slug(value: impl Into<String>) -> Self {
        Self::Slug(value.into())
    }

    /// Convert to the canonical form
    pub fn normalize(&self) -> SessionResult<Permission> {
        match self {
            RawPermission::Slug(slug) => parse_slug(slug),
            RawPermission::Structured {
                resource,
                action,
                scope,
                conditions,
            } => {
                if resource.is_empty() || action.is_empty() {
                    return Err(SessionError::invalid_payload(format!(
                        "permission with empty resource or action: '{}:{}'",
                        resource, action
                    )));
                }
                let scope = parse_scope(scope.as_deref())?;
                Ok(Permission::new(resource.as_str(), action.as_str(), scope).with_conditions(conditions.clone()))
            }
        }
    }
}

fn parse_scope(scope: Option<&str>) -> SessionResult<PermissionScope> {
    match scope {
        None => Ok(PermissionScope::Tenant),
        Some(value) => value
            .parse()
            .map_err(|_| SessionError::invalid_payload(format!("unknown permission scope '{}'", value))),
    }
}

fn parse_slug(slug: &str) -> SessionResult<Permission> {
    let slug = slug.trim();
    if slug == WILDCARD {
        return Ok(Permission::wildcard());
    }

    let parts: Vec<&str> = slug.split(':').collect();
    match parts.as_slice() {
        [resource, action] if !resource.is_empty() && !action.is_empty() => {
            Ok(Permission::new(*resource, *action, PermissionScope::Tenant))
        }
        [resource, action, scope] if !resource.is_empty() && !action.is_empty() => {
            Ok(Permission::new(*resource, *action, parse_scope(Some(scope))?))
        }
        _ => Err(SessionError::invalid_payload(format!("malformed permission slug '{}'", slug))),
    }
}

/// Normalise a whole permission list, failing on the first bad entry
pub fn normalize_permissions(raw: &[RawPermission]) -> SessionResult<Vec<Permission>> {
    raw.iter().map(RawPermission::normalize).collect()
}

/// Role as sent by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRole {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub level: RoleLevel,
    #[serde(default)]
    pub permissions: Vec<RawPermission>,
}

impl RawRole {
    pub fn normalize(&self) -> SessionResult<Role> {
        let mut role = Role::new(self.name.as_str(), self.level).with_permissions(normalize_permissions(&self.permissions)?);
        if let Some(display_name) = &self.display_name {
            role.display_name = display_name.clone();
        }
        Ok(role)
    }
}

/// User as sent by the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIdentity {
    pub id: UserId,
    pub email: String,
    #[serde(default, alias = "name")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub role: RawRole,
    /// Missing on older payloads; the login tenant is used instead
    #[serde(default, alias = "tenantId")]
    pub home_tenant_id: Option<TenantId>,
}

impl RawIdentity {
    pub fn normalize(&self, login_tenant: &TenantId) -> SessionResult<Identity> {
        if self.id.as_str().is_empty() {
            return Err(SessionError::invalid_payload("identity without an id"));
        }
        Ok(Identity {
            id: self.id.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone().unwrap_or_else(|| self.email.clone()),
            avatar_url: self.avatar_url.clone(),
            role: self.role.normalize()?,
            home_tenant_id: self.home_tenant_id.clone().unwrap_or_else(|| login_tenant.clone()),
        })
    }
}

/// Identity provider login (and hydration) response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: BearerToken,
    pub user: RawIdentity,
    pub tenant: Tenant,
    #[serde(default)]
    pub permissions: Vec<RawPermission>,
    #[serde(default)]
    pub available_tenants: Vec<Tenant>,
}

/// Tenant service switch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchTenantResponse {
    pub token: BearerToken,
    pub tenant: Tenant,
    #[serde(default)]
    pub permissions: Vec<RawPermission>,
}

/// Identity provider refresh response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub token: BearerToken,
}

/// Body of a create-tenant call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantRequest {
    pub parent_tenant_id: Option<TenantId>,
    /// Requested id; the service assigns one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TenantId>,
    pub name: String,
    pub max_sub_tenants: u32,
    #[serde(default)]
    pub plan: TenantPlan,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub settings: HashMap<String, serde_json::Value>,
}

impl CreateTenantRequest {
    pub fn new(name: impl Into<String>, max_sub_tenants: u32) -> Self {
        Self {
            parent_tenant_id: None,
            id: None,
            name: name.into(),
            max_sub_tenants,
            plan: TenantPlan::default(),
            settings: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<TenantId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_plan(mut self, plan: TenantPlan) -> Self {
        self.plan = plan;
        self
    }
}

/// Mutable tenant attributes. Re-parenting is a separate move call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<TenantPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl TenantPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.plan.is_none() && self.settings.is_none() && self.is_active.is_none()
    }

    /// Apply the patch to a local copy
    pub fn apply_to(&self, tenant: &mut Tenant) {
        if let Some(name) = &self.name {
            tenant.name = name.clone();
        }
        if let Some(plan) = self.plan {
            tenant.plan = plan;
        }
        if let Some(settings) = &self.settings {
            tenant.settings = settings.clone();
        }
        if let Some(is_active) = self.is_active {
            tenant.is_active = is_active;
        }
    }
}

/// Body of a move-tenant call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTenantRequest {
    pub new_parent_id: Option<TenantId>,
}

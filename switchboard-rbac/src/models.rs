//! Data models for identities, roles, permissions and tenants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RbacError;

/// Matches any resource or action name
pub const WILDCARD: &str = "*";

/// Separator between segments of a tenant path
pub const PATH_SEPARATOR: char = '/';

/// Tenant identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Principal identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Subscription plan of a tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantPlan {
    #[default]
    Free,
    Starter,
    Professional,
    Enterprise,
}

/// A node in the tenant forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub parent_tenant_id: Option<TenantId>,
    /// Ancestor ids from the root, ending in this tenant's id
    pub tenant_path: String,
    /// Number of ancestors
    pub level: u32,
    pub max_sub_tenants: u32,
    pub current_sub_tenants: u32,
    #[serde(default)]
    pub plan: TenantPlan,
    pub is_active: bool,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tenant {
    /// Create a new root tenant
    pub fn root(id: impl Into<TenantId>, name: impl Into<String>, max_sub_tenants: u32) -> Self {
        let id = id.into();
        Self {
            tenant_path: id.to_string(),
            id,
            name: name.into(),
            parent_tenant_id: None,
            level: 0,
            max_sub_tenants,
            current_sub_tenants: 0,
            plan: TenantPlan::default(),
            is_active: true,
            settings: HashMap::new(),
            updated_at: None,
        }
    }

    /// Create a tenant positioned directly under `parent`.
    ///
    /// Only the child is built; the parent's sub-tenant counter is untouched.
    pub fn child_of(
        parent: &Tenant,
        id: impl Into<TenantId>,
        name: impl Into<String>,
        max_sub_tenants: u32,
    ) -> Self {
        let id = id.into();
        Self {
            tenant_path: format!("{}{}{}", parent.tenant_path, PATH_SEPARATOR, id),
            id,
            name: name.into(),
            parent_tenant_id: Some(parent.id.clone()),
            level: parent.level + 1,
            max_sub_tenants,
            current_sub_tenants: 0,
            plan: parent.plan,
            is_active: true,
            settings: HashMap::new(),
            updated_at: None,
        }
    }

    pub fn with_plan(mut self, plan: TenantPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Check if tenant is active
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_root(&self) -> bool {
        self.parent_tenant_id.is_none()
    }

    /// Raw path segments, root first
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.tenant_path.split(PATH_SEPARATOR)
    }
}

/// Breadth of a permission grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    /// The caller's own resources
    Own,
    /// The active tenant only
    Tenant,
    /// The active tenant and its descendants
    Subtenant,
    /// Unrestricted
    All,
}

impl PermissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionScope::Own => "own",
            PermissionScope::Tenant => "tenant",
            PermissionScope::Subtenant => "subtenant",
            PermissionScope::All => "all",
        }
    }

    /// Whether a grant with this scope answers a query for `requested`
    pub fn covers(&self, requested: PermissionScope) -> bool {
        *self == requested || *self == PermissionScope::All
    }
}

impl fmt::Display for PermissionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionScope {
    type Err = RbacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "own" => Ok(PermissionScope::Own),
            "tenant" => Ok(PermissionScope::Tenant),
            "subtenant" => Ok(PermissionScope::Subtenant),
            "all" => Ok(PermissionScope::All),
            other => Err(RbacError::InvalidScope {
                scope: other.to_string(),
            }),
        }
    }
}

/// Comparison used by a permission condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    In,
    NotIn,
    Gt,
    Lt,
    Contains,
}

/// Predicate over a field of the target resource.
///
/// Conditions are carried for downstream enforcement and never evaluated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

/// Permission definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: String,
    pub scope: PermissionScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Permission {
    /// Create a new permission
    pub fn new(resource: impl Into<String>, action: impl Into<String>, scope: PermissionScope) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            scope,
            conditions: Vec::new(),
        }
    }

    /// Grant on every resource and action
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD, PermissionScope::All)
    }

    /// Create permission with conditions
    pub fn with_conditions(mut self, conditions: Vec<Condition>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Resource and action match, wildcards included
    pub fn grants(&self, resource: &str, action: &str) -> bool {
        (self.resource == resource || self.resource == WILDCARD)
            && (self.action == action || self.action == WILDCARD)
    }

    /// Check if permission matches the given request
    pub fn matches(&self, resource: &str, action: &str, scope: Option<PermissionScope>) -> bool {
        self.grants(resource, action) && scope.map_or(true, |requested| self.scope.covers(requested))
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.action, self.scope)
    }
}

/// Level at which a role is defined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleLevel {
    /// Platform operators; satisfies every check
    System,
    Tenant,
    User,
}

impl RoleLevel {
    pub fn is_system(&self) -> bool {
        matches!(self, RoleLevel::System)
    }
}

/// Role definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub name: String,
    pub display_name: String,
    pub level: RoleLevel,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(name: impl Into<String>, level: RoleLevel) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            level,
            permissions: Vec::new(),
        }
    }

    pub fn with_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.permissions = permissions;
        self
    }
}

/// Authenticated principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub role: Role,
    pub home_tenant_id: TenantId,
}

impl Identity {
    pub fn role_level(&self) -> RoleLevel {
        self.role.level
    }
}

/// Resource types for permission checking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Agent,
    Collection,
    Document,
    Tenant,
    User,
    Role,
    Setting,
    ApiKey,
}

impl ResourceType {
    /// Convert to string for use in permissions
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Agent => "agents",
            ResourceType::Collection => "collections",
            ResourceType::Document => "documents",
            ResourceType::Tenant => "tenants",
            ResourceType::User => "users",
            ResourceType::Role => "roles",
            ResourceType::Setting => "settings",
            ResourceType::ApiKey => "api_keys",
        }
    }
}

/// Action types for permission checking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Create,
    Read,
    Update,
    Delete,
    Manage,
    List,
}

impl ActionType {
    /// Convert to string for use in permissions
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Read => "read",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
            ActionType::Manage => "manage",
            ActionType::List => "list",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_tenant() {
        let tenant = Tenant::root("acme", "Acme", 5);
        assert_eq!(tenant.tenant_path, "acme");
        assert_eq!(tenant.level, 0);
        assert!(tenant.is_root());
        assert!(tenant.is_active());
    }

    #[test]
    fn test_child_tenant_path() {
        let root = Tenant::root("acme", "Acme", 5);
        let child = Tenant::child_of(&root, "emea", "EMEA", 2);
        let grandchild = Tenant::child_of(&child, "fr", "France", 0);

        assert_eq!(child.tenant_path, "acme/emea");
        assert_eq!(grandchild.tenant_path, "acme/emea/fr");
        assert_eq!(grandchild.level, 2);
        assert_eq!(grandchild.parent_tenant_id, Some(TenantId::from("emea")));
        assert_eq!(root.current_sub_tenants, 0);
    }

    #[test]
    fn test_scope_parsing() {
        assert_eq!("Subtenant".parse::<PermissionScope>().unwrap(), PermissionScope::Subtenant);
        assert!("planet".parse::<PermissionScope>().is_err());
    }

    #[test]
    fn test_permission_matching() {
        let perm = Permission::new("agents", "update", PermissionScope::Tenant);
        assert!(perm.matches("agents", "update", None));
        assert!(perm.matches("agents", "update", Some(PermissionScope::Tenant)));
        assert!(!perm.matches("agents", "update", Some(PermissionScope::All)));
        assert!(!perm.matches("agents", "delete", None));

        let any_action = Permission::new("agents", WILDCARD, PermissionScope::All);
        assert!(any_action.matches("agents", "delete", Some(PermissionScope::Own)));
        assert!(!any_action.matches("tenants", "delete", None));
    }

    #[test]
    fn test_tenant_wire_format() {
        let json = serde_json::json!({
            "id": "emea",
            "name": "EMEA",
            "parentTenantId": "acme",
            "tenantPath": "acme/emea",
            "level": 1,
            "maxSubTenants": 3,
            "currentSubTenants": 1,
            "plan": "enterprise",
            "isActive": true
        });

        let tenant: Tenant = serde_json::from_value(json).unwrap();
        assert_eq!(tenant.parent_tenant_id, Some(TenantId::from("acme")));
        assert_eq!(tenant.plan, TenantPlan::Enterprise);
        assert!(tenant.settings.is_empty());
    }
}

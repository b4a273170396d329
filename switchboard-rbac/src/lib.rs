//! Multi-tenant access model for Switchboard
//!
//! This crate provides the pure, I/O-free half of the identity core:
//! - The tenant hierarchy (ancestry paths, descendant checks, re-parenting)
//! - Capability-based permissions with wildcard and scope matching
//! - The shared identity, role and tenant data model

pub mod error;
pub mod models;
pub mod permissions;
pub mod tenant;

pub use error::{RbacError, RbacResult};
pub use models::{
    ActionType, Condition, ConditionOperator, Identity, Permission, PermissionScope, ResourceType,
    Role, RoleLevel, Tenant, TenantId, TenantPlan, UserId, PATH_SEPARATOR, WILDCARD,
};
pub use permissions::{
    has_permission, scope_satisfied, PermissionChecker, PermissionSet, ResourceRef, ScopeContext,
};
pub use tenant::{can_attach_child, is_descendant_of, path, TenantHierarchy, TenantMove};

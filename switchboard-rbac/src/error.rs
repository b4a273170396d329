//! Error types for RBAC and hierarchy operations

use thiserror::Error;

/// Result type for RBAC operations
pub type RbacResult<T> = Result<T, RbacError>;

/// RBAC-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RbacError {
    /// Permission denied
    #[error("Permission denied: {action} on {resource} in tenant {tenant_id}")]
    PermissionDenied {
        action: String,
        resource: String,
        tenant_id: String,
    },

    /// Tenant not found in the local hierarchy
    #[error("Tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: String },

    /// Stored path disagrees with the tenant id or its parent
    #[error("Tenant {tenant_id} has inconsistent path '{tenant_path}': {reason}")]
    PathMismatch {
        tenant_id: String,
        tenant_path: String,
        reason: String,
    },

    /// Stored level disagrees with the number of ancestors
    #[error("Tenant {tenant_id} has level {level} but its path has {segments} segments")]
    LevelMismatch {
        tenant_id: String,
        level: u32,
        segments: usize,
    },

    /// Parent cannot take another child
    #[error("Tenant {tenant_id} has reached its sub-tenant limit of {max_sub_tenants}")]
    SubTenantLimitExceeded {
        tenant_id: String,
        max_sub_tenants: u32,
    },

    /// Parent is deactivated
    #[error("Tenant {tenant_id} is inactive")]
    TenantInactive { tenant_id: String },

    /// Re-parenting would break the tree
    #[error("Invalid move of tenant {tenant_id}: {reason}")]
    InvalidMove { tenant_id: String, reason: String },

    /// Unknown permission scope
    #[error("Invalid permission scope: {scope}")]
    InvalidScope { scope: String },
}

impl RbacError {
    /// Create a new permission denied error
    pub fn permission_denied(
        action: impl Into<String>,
        resource: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            action: action.into(),
            resource: resource.into(),
            tenant_id: tenant_id.into(),
        }
    }

    pub(crate) fn path_mismatch(
        tenant_id: impl Into<String>,
        tenant_path: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::PathMismatch {
            tenant_id: tenant_id.into(),
            tenant_path: tenant_path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_move(tenant_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMove {
            tenant_id: tenant_id.into(),
            reason: reason.into(),
        }
    }

    /// Check if this is a permission denied error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Hierarchy data no longer agrees with itself.
    ///
    /// These indicate a desynchronized client and are never repaired locally.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, Self::PathMismatch { .. } | Self::LevelMismatch { .. })
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TenantNotFound { .. })
    }
}

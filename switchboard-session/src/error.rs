//! Error types for identity, credential store and session operations

use switchboard_rbac::RbacError;
use thiserror::Error;

use crate::session::Operation;

/// Result type for identity provider and tenant service calls
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Result type for credential store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Failures reported by the identity provider or tenant service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Credential expired")]
    ExpiredCredential,

    #[error("Tenant is suspended")]
    TenantSuspended,

    /// 401 on an authenticated request
    #[error("Credential rejected")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Unexpected response status {status}: {message}")]
    Unexpected { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl IdentityError {
    /// The credential is no longer valid (the 401 class)
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::ExpiredCredential)
    }

    /// Any rejection of who the caller is
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials | Self::ExpiredCredential | Self::TenantSuspended | Self::Unauthorized
        )
    }

    /// Transient failures a user may retry
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::ServiceUnavailable | Self::RateLimited { .. }
        )
    }

    /// Caller-facing message
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidCredentials => "The email or password is incorrect.".to_string(),
            Self::ExpiredCredential => "Your session has expired. Please sign in again.".to_string(),
            Self::TenantSuspended => {
                "This organization is suspended. Contact your administrator.".to_string()
            }
            Self::Unauthorized => "You are signed out. Please sign in again.".to_string(),
            Self::Forbidden(_) => "You do not have access to this resource.".to_string(),
            Self::NotFound(_) => "The requested resource was not found.".to_string(),
            Self::Network(_) => "Network error. Check your connection and try again.".to_string(),
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Try again shortly.".to_string()
            }
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => format!("Too many requests. Try again in {} seconds.", secs),
            Self::RateLimited { retry_after_secs: None } => {
                "Too many requests. Try again shortly.".to_string()
            }
            Self::Unexpected { .. } | Self::InvalidResponse(_) => {
                "Something went wrong. Try again.".to_string()
            }
        }
    }
}

/// Credential store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store refused the write
    #[error("Store rejected write of '{key}': {reason}")]
    Rejected { key: String, reason: String },
}

impl StoreError {
    pub fn rejected(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Authorization failures raised by the session layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Switching to tenant {tenant_id} is not allowed")]
    TenantSwitchDenied { tenant_id: String },

    #[error(transparent)]
    Permission(RbacError),
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Identity provider or tenant service failure
    #[error("Identity service error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Not authorized: {0}")]
    Authorization(#[from] AuthorizationError),

    /// Hierarchy data disagrees with itself
    #[error("Tenant hierarchy error: {0}")]
    Integrity(RbacError),

    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    /// The identity provider returned data that cannot be normalised
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    /// The session is acting in the tenant, or inside its subtree
    #[error("Tenant {tenant_id} holds the active tenant")]
    ActiveTenant { tenant_id: String },

    /// A newer call of the same kind finished first
    #[error("{operation} superseded by a newer call")]
    Superseded { operation: Operation },

    #[error("Session has been torn down")]
    TornDown,
}

impl From<RbacError> for SessionError {
    fn from(err: RbacError) -> Self {
        if err.is_permission_denied() {
            Self::Authorization(AuthorizationError::Permission(err))
        } else {
            Self::Integrity(err)
        }
    }
}

impl SessionError {
    pub(crate) fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /// The credential was invalidated
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Identity(err) if err.is_unauthorized())
    }

    /// The identity provider refused who the caller is
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Identity(err) if err.is_auth_failure())
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Identity(err) if err.is_connectivity())
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }

    /// Caller-facing message
    pub fn user_message(&self) -> String {
        match self {
            Self::Identity(err) => err.user_message(),
            Self::Authorization(AuthorizationError::TenantSwitchDenied { .. }) => {
                "You do not have access to that organization.".to_string()
            }
            Self::Authorization(AuthorizationError::Permission(_)) => {
                "You do not have permission to do that.".to_string()
            }
            Self::Integrity(RbacError::SubTenantLimitExceeded { max_sub_tenants, .. }) => format!(
                "This organization already has the maximum of {} sub-organizations.",
                max_sub_tenants
            ),
            Self::Integrity(_) | Self::InvalidPayload(_) => {
                "Organization data is out of date. Reload and try again.".to_string()
            }
            Self::Store(_) => "Could not save your session on this device.".to_string(),
            Self::NotAuthenticated => "Please sign in.".to_string(),
            Self::ActiveTenant { .. } => {
                "Switch to another organization before deleting this one.".to_string()
            }
            Self::Superseded { .. } | Self::TornDown => "The request was cancelled.".to_string(),
        }
    }
}

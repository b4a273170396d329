//! Session and identity management for Switchboard
//!
//! This crate owns the authenticated session:
//! - [`SessionManager`]: login, hydration, tenant switching, refresh and logout
//! - Credential replication into persisted storage and cookies
//! - Seams to the identity provider and tenant service, with HTTP clients
//! - [`TenantAdmin`] for permission-gated tenant management

pub mod credential;
pub mod error;
pub mod http;
pub mod manager;
pub mod provider;
pub mod session;
pub mod store;
pub mod tenants;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use credential::{BearerToken, Credential};
pub use error::{
    AuthorizationError, IdentityError, IdentityResult, SessionError, SessionResult, StoreError, StoreResult,
};
pub use http::{HttpIdentityProvider, HttpTenantService};
pub use manager::SessionManager;
pub use provider::{IdentityProvider, TenantService};
pub use session::{Operation, Session, SessionSnapshot, SessionState};
pub use store::{CookieJar, CredentialStores, FileTokenStorage, MemoryCookieJar, MemoryTokenStorage, TokenStorage};
pub use tenants::TenantAdmin;
pub use wire::{normalize_permissions, CreateTenantRequest, LoginResponse, RawPermission, SwitchTenantResponse, TenantPatch};

// Re-exported for callers that build login secrets
pub use secrecy::SecretString;

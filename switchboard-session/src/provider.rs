//! Seams to the external identity provider and tenant management service

use async_trait::async_trait;
use secrecy::SecretString;

use switchboard_rbac::{Tenant, TenantId};

use crate::credential::{BearerToken, Credential};
use crate::error::IdentityResult;
use crate::wire::{CreateTenantRequest, LoginResponse, SwitchTenantResponse, TenantPatch};

/// Authenticates principals and vouches for credentials
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a principal and secret for a session payload
    async fn login(&self, principal: &str, secret: &SecretString) -> IdentityResult<LoginResponse>;

    /// Session payload for an existing credential, used to hydrate
    async fn current_session(&self, credential: &Credential) -> IdentityResult<LoginResponse>;

    /// Reissue the token for the same tenant context
    async fn refresh(&self, credential: &Credential) -> IdentityResult<BearerToken>;

    async fn logout(&self, credential: &Credential) -> IdentityResult<()>;
}

/// Tenant management service. Every call is authenticated with `credential`.
#[async_trait]
pub trait TenantService: Send + Sync {
    /// Reissue the credential for another tenant
    async fn switch_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
    ) -> IdentityResult<SwitchTenantResponse>;

    async fn create_tenant(
        &self,
        credential: &Credential,
        request: &CreateTenantRequest,
    ) -> IdentityResult<Tenant>;

    async fn update_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        patch: &TenantPatch,
    ) -> IdentityResult<Tenant>;

    async fn delete_tenant(&self, credential: &Credential, tenant_id: &TenantId) -> IdentityResult<()>;

    /// Re-parent a tenant. Returns the moved subtree, moved tenant first.
    async fn move_tenant(
        &self,
        credential: &Credential,
        tenant_id: &TenantId,
        new_parent: Option<&TenantId>,
    ) -> IdentityResult<Vec<Tenant>>;

    async fn list_sub_tenants(&self, credential: &Credential, tenant_id: &TenantId) -> IdentityResult<Vec<Tenant>>;

    /// Pre-computed subtree rooted at `root`, root included
    async fn hierarchy(&self, credential: &Credential, root: &TenantId) -> IdentityResult<Vec<Tenant>>;
}

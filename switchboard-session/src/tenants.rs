//! Tenant administration
//!
//! Gates tenant service calls with the caller's permissions, validates them
//! against the local hierarchy first, and reflects confirmed changes locally.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

use switchboard_rbac::{
    can_attach_child, is_descendant_of, require_permission, ActionType, RbacError, ResourceRef, ResourceType, Tenant, TenantHierarchy,
    TenantId, TenantMove,
};

use crate::error::{SessionError, SessionResult};
use crate::manager::SessionManager;
use crate::provider::TenantService;
use crate::wire::{CreateTenantRequest, TenantPatch};

/// Tenant management on behalf of the signed-in caller
pub struct TenantAdmin {
    session: Arc<SessionManager>,
    service: Arc<dyn TenantService>,
    hierarchy: RwLock<TenantHierarchy>,
}

impl TenantAdmin {
    pub fn new(session: Arc<SessionManager>) -> Self {
        let service = session.tenant_service();
        Self::with_service(session, service)
    }

    pub fn with_service(session: Arc<SessionManager>, service: Arc<dyn TenantService>) -> Self {
        Self {
            session,
            service,
            hierarchy: RwLock::new(TenantHierarchy::new()),
        }
    }

    /// Copy of the local hierarchy
    pub fn hierarchy(&self) -> TenantHierarchy {
        self.hierarchy.read().clone()
    }

    pub fn tenant(&self, tenant_id: &TenantId) -> Option<Tenant> {
        self.hierarchy.read().get(tenant_id).cloned()
    }

    fn known(&self, tenant_id: &TenantId) -> SessionResult<Tenant> {
        self.tenant(tenant_id).ok_or_else(|| {
            RbacError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            }
            .into()
        })
    }

    /// Fail unless the caller may perform `action` on `target`
    fn guard(&self, action: ActionType, target: &Tenant) -> SessionResult<()> {
        let snapshot = self.session.snapshot();
        let session = match snapshot.session.as_deref() {
            Some(session) if snapshot.state.is_authenticated() => session,
            _ => return Err(SessionError::NotAuthenticated),
        };
        let checker = session.checker();
        let ctx = session.scope_context();
        require_permission!(checker, &ctx, ResourceType::Tenant, action, &ResourceRef::in_tenant(target));
        Ok(())
    }

    /// Fetch the subtree under `root` and install it locally
    pub async fn load_hierarchy(&self, root: &TenantId) -> SessionResult<usize> {
        let service = self.service.clone();
        let root_id = root.clone();
        let subtree = self
            .session
            .authorized(move |credential| async move { service.hierarchy(&credential, &root_id).await })
            .await?;

        let root_tenant = subtree
            .iter()
            .find(|t| &t.id == root)
            .ok_or_else(|| SessionError::invalid_payload(format!("hierarchy of {} lacks its root", root)))?;
        self.guard(ActionType::Read, root_tenant)?;

        let count = subtree.len();
        self.hierarchy.write().replace_subtree(subtree)?;
        debug!(root = %root, count, "Loaded tenant hierarchy");
        Ok(count)
    }

    /// Create a tenant under `parent_id`.
    ///
    /// A parent at its sub-tenant limit is rejected before the service is called.
    pub async fn create_sub_tenant(
        &self,
        parent_id: &TenantId,
        mut request: CreateTenantRequest,
    ) -> SessionResult<Tenant> {
        let parent = self.known(parent_id)?;
        self.guard(ActionType::Create, &parent)?;
        if !can_attach_child(&parent) {
            let err = if parent.is_active() {
                RbacError::SubTenantLimitExceeded {
                    tenant_id: parent.id.to_string(),
                    max_sub_tenants: parent.max_sub_tenants,
                }
            } else {
                RbacError::TenantInactive {
                    tenant_id: parent.id.to_string(),
                }
            };
            return Err(err.into());
        }

        request.parent_tenant_id = Some(parent_id.clone());
        let service = self.service.clone();
        let created = self
            .session
            .authorized(move |credential| async move { service.create_tenant(&credential, &request).await })
            .await?;

        let updated_parent = {
            let mut hierarchy = self.hierarchy.write();
            hierarchy.attach_child(parent_id, created.clone())?;
            hierarchy.get(parent_id).cloned()
        };
        if let Some(parent) = updated_parent {
            self.session.apply_tenant_updates(&[parent])?;
        }
        info!(tenant_id = %created.id, parent_id = %parent_id, "Created sub-tenant");
        Ok(created)
    }

    /// Change name, plan, settings or active flag
    pub async fn update_tenant(&self, tenant_id: &TenantId, patch: TenantPatch) -> SessionResult<Tenant> {
        let tenant = self.known(tenant_id)?;
        self.guard(ActionType::Update, &tenant)?;
        if patch.is_empty() {
            return Ok(tenant);
        }

        let service = self.service.clone();
        let id = tenant_id.clone();
        let updated = self
            .session
            .authorized(move |credential| async move { service.update_tenant(&credential, &id, &patch).await })
            .await?;

        self.hierarchy.write().update(updated.clone())?;
        self.session.apply_tenant_updates(std::slice::from_ref(&updated))?;
        info!(tenant_id = %tenant_id, "Updated tenant");
        Ok(updated)
    }

    /// Re-parent a tenant, or make it a root when `new_parent` is `None`.
    ///
    /// The move is planned locally first; the subtree the service returns must
    /// match the plan and is then applied in one replacement.
    pub async fn move_tenant(&self, tenant_id: &TenantId, new_parent: Option<&TenantId>) -> SessionResult<Vec<Tenant>> {
        let tenant = self.known(tenant_id)?;
        self.guard(ActionType::Update, &tenant)?;
        if let Some(parent_id) = new_parent {
            let parent = self.known(parent_id)?;
            self.guard(ActionType::Update, &parent)?;
        }

        // Rejects cycles and full parents before the service is called
        self.hierarchy.read().plan_move(tenant_id, new_parent)?;

        let service = self.service.clone();
        let id = tenant_id.clone();
        let parent_id = new_parent.cloned();
        let subtree = self
            .session
            .authorized(move |credential| async move {
                service.move_tenant(&credential, &id, parent_id.as_ref()).await
            })
            .await?;

        // Plan again: the hierarchy may have changed while the call was out
        let affected = {
            let mut hierarchy = self.hierarchy.write();
            let planned = hierarchy.plan_move(tenant_id, new_parent)?;
            if !same_layout(&planned.subtree, &subtree) {
                return Err(RbacError::InvalidMove {
                    tenant_id: tenant_id.to_string(),
                    reason: "service returned a subtree that differs from the local plan".to_string(),
                }
                .into());
            }

            let confirmed = TenantMove {
                subtree: subtree.clone(),
                ..planned
            };
            let mut affected = confirmed.subtree.clone();
            affected.extend(confirmed.parents.iter().cloned());
            hierarchy.apply_move(confirmed)?;
            affected
        };
        self.session.apply_tenant_updates(&affected)?;

        info!(
            tenant_id = %tenant_id,
            new_parent = ?new_parent.map(TenantId::as_str),
            moved = subtree.len(),
            "Moved tenant"
        );
        Ok(subtree)
    }

    /// Delete a tenant and its subtree once the service confirms.
    ///
    /// The subtree holding the session's active tenant cannot be deleted.
    pub async fn delete_tenant(&self, tenant_id: &TenantId) -> SessionResult<Vec<Tenant>> {
        let tenant = self.known(tenant_id)?;
        self.guard(ActionType::Delete, &tenant)?;
        let snapshot = self.session.snapshot();
        if let Some(active) = snapshot.active_tenant() {
            if active.id == tenant.id || is_descendant_of(active, &tenant) {
                return Err(SessionError::ActiveTenant {
                    tenant_id: tenant.id.to_string(),
                });
            }
        }

        let service = self.service.clone();
        let id = tenant_id.clone();
        self.session
            .authorized(move |credential| async move { service.delete_tenant(&credential, &id).await })
            .await?;

        let (removed, parent) = {
            let mut hierarchy = self.hierarchy.write();
            let removed = hierarchy.remove(tenant_id)?;
            let parent = tenant
                .parent_tenant_id
                .as_ref()
                .and_then(|parent_id| hierarchy.get(parent_id).cloned());
            (removed, parent)
        };

        let removed_ids: Vec<TenantId> = removed.iter().map(|t| t.id.clone()).collect();
        self.session.forget_tenants(&removed_ids);
        if let Some(parent) = parent {
            self.session.apply_tenant_updates(&[parent])?;
        }
        info!(tenant_id = %tenant_id, removed = removed.len(), "Deleted tenant");
        Ok(removed)
    }

    /// Direct children of a tenant, refreshed from the service
    pub async fn list_sub_tenants(&self, tenant_id: &TenantId) -> SessionResult<Vec<Tenant>> {
        let tenant = self.known(tenant_id)?;
        self.guard(ActionType::Read, &tenant)?;

        let service = self.service.clone();
        let id = tenant_id.clone();
        let children = self
            .session
            .authorized(move |credential| async move { service.list_sub_tenants(&credential, &id).await })
            .await?;

        let mut hierarchy = self.hierarchy.write();
        for child in &children {
            if hierarchy.get(&child.id).is_some() {
                hierarchy.update(child.clone())?;
            } else {
                hierarchy.insert(child.clone())?;
            }
        }
        Ok(children)
    }
}

/// Same ids at the same paths and levels, in any order
fn same_layout(planned: &[Tenant], confirmed: &[Tenant]) -> bool {
    planned.len() == confirmed.len()
        && planned.iter().all(|p| {
            confirmed
                .iter()
                .any(|c| c.id == p.id && c.tenant_path == p.tenant_path && c.level == p.level)
        })
}

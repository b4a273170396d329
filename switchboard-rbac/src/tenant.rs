//! Tenant hierarchy model
//!
//! Tenants form a forest. Every tenant carries its full ancestry in
//! `tenant_path`, so ancestry questions never need to walk the tree. The
//! [`TenantHierarchy`] directory keeps a local copy of known tenants and
//! applies structural changes as whole-state replacements.

use std::collections::HashMap;
use tracing::debug;

use crate::{
    error::{RbacError, RbacResult},
    models::{Tenant, TenantId, PATH_SEPARATOR},
};

/// Ancestor ids from the root down to `tenant` itself.
///
/// Fails when the stored path disagrees with the tenant's id, parent or level.
pub fn path(tenant: &Tenant) -> RbacResult<Vec<TenantId>> {
    let segments: Vec<&str> = tenant.path_segments().collect();

    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(RbacError::path_mismatch(
            tenant.id.as_str(),
            &tenant.tenant_path,
            "path contains an empty segment",
        ));
    }

    if segments.len() != tenant.level as usize + 1 {
        return Err(RbacError::LevelMismatch {
            tenant_id: tenant.id.to_string(),
            level: tenant.level,
            segments: segments.len(),
        });
    }

    if segments.last().copied() != Some(tenant.id.as_str()) {
        return Err(RbacError::path_mismatch(
            tenant.id.as_str(),
            &tenant.tenant_path,
            "path does not end in the tenant id",
        ));
    }

    let parent_segment = segments.len().checked_sub(2).map(|idx| segments[idx]);
    if parent_segment != tenant.parent_tenant_id.as_ref().map(TenantId::as_str) {
        return Err(RbacError::path_mismatch(
            tenant.id.as_str(),
            &tenant.tenant_path,
            "parent id does not match the path",
        ));
    }

    Ok(segments.into_iter().map(TenantId::new).collect())
}

/// True iff `ancestor` appears among `candidate`'s ancestors.
///
/// A tenant is not its own descendant.
pub fn is_descendant_of(candidate: &Tenant, ancestor: &Tenant) -> bool {
    let segments: Vec<&str> = candidate.path_segments().collect();
    let ancestors = &segments[..segments.len().saturating_sub(1)];
    ancestors.contains(&ancestor.id.as_str())
}

/// Whether `parent` may take another sub-tenant
pub fn can_attach_child(parent: &Tenant) -> bool {
    parent.is_active && parent.current_sub_tenants < parent.max_sub_tenants
}

fn ensure_can_attach(parent: &Tenant) -> RbacResult<()> {
    if !parent.is_active {
        return Err(RbacError::TenantInactive {
            tenant_id: parent.id.to_string(),
        });
    }
    if parent.current_sub_tenants >= parent.max_sub_tenants {
        return Err(RbacError::SubTenantLimitExceeded {
            tenant_id: parent.id.to_string(),
            max_sub_tenants: parent.max_sub_tenants,
        });
    }
    Ok(())
}

fn join_path(base: &str, id: &TenantId) -> String {
    format!("{}{}{}", base, PATH_SEPARATOR, id)
}

/// A re-parenting composed against the current hierarchy but not yet applied
#[derive(Debug, Clone, PartialEq)]
pub struct TenantMove {
    pub tenant_id: TenantId,
    pub old_parent: Option<TenantId>,
    pub new_parent: Option<TenantId>,
    /// The moved tenant followed by every descendant, with recomputed paths
    pub subtree: Vec<Tenant>,
    /// Old and new parents with adjusted sub-tenant counters
    pub parents: Vec<Tenant>,
}

impl TenantMove {
    /// Ids touched by this move
    pub fn affected_ids(&self) -> impl Iterator<Item = &TenantId> {
        self.subtree.iter().chain(self.parents.iter()).map(|t| &t.id)
    }
}

/// Local directory of known tenants
#[derive(Debug, Clone, Default)]
pub struct TenantHierarchy {
    tenants: HashMap<TenantId, Tenant>,
}

impl TenantHierarchy {
    /// Create an empty hierarchy
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a hierarchy from tenants whose paths are already consistent
    pub fn from_tenants(tenants: impl IntoIterator<Item = Tenant>) -> RbacResult<Self> {
        let hierarchy = Self {
            tenants: tenants.into_iter().map(|t| (t.id.clone(), t)).collect(),
        };
        hierarchy.validate()?;
        Ok(hierarchy)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// Get tenant by ID
    pub fn get(&self, tenant_id: &TenantId) -> Option<&Tenant> {
        self.tenants.get(tenant_id)
    }

    fn require(&self, tenant_id: &TenantId) -> RbacResult<&Tenant> {
        self.tenants.get(tenant_id).ok_or_else(|| RbacError::TenantNotFound {
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Insert a single tenant after checking its path
    pub fn insert(&mut self, tenant: Tenant) -> RbacResult<()> {
        path(&tenant)?;
        Self::check_link(&tenant, &self.tenants)?;
        self.tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    /// Replace a tenant's attributes. Re-parenting goes through [`Self::plan_move`].
    pub fn update(&mut self, tenant: Tenant) -> RbacResult<()> {
        let existing = self.require(&tenant.id)?;
        if existing.tenant_path != tenant.tenant_path || existing.level != tenant.level {
            return Err(RbacError::path_mismatch(
                tenant.id.as_str(),
                &tenant.tenant_path,
                format!("update would change the path from '{}'", existing.tenant_path),
            ));
        }
        path(&tenant)?;
        self.tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    /// Tenants without a parent
    pub fn roots(&self) -> Vec<&Tenant> {
        let mut roots: Vec<&Tenant> = self.tenants.values().filter(|t| t.is_root()).collect();
        roots.sort_by(|a, b| a.id.cmp(&b.id));
        roots
    }

    /// Direct children of a tenant
    pub fn children(&self, tenant_id: &TenantId) -> Vec<&Tenant> {
        let mut children: Vec<&Tenant> = self
            .tenants
            .values()
            .filter(|t| t.parent_tenant_id.as_ref() == Some(tenant_id))
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        children
    }

    /// Every descendant of a tenant, shallowest first
    pub fn descendants(&self, tenant_id: &TenantId) -> Vec<&Tenant> {
        let Some(ancestor) = self.tenants.get(tenant_id) else {
            return Vec::new();
        };
        let mut descendants: Vec<&Tenant> = self
            .tenants
            .values()
            .filter(|t| is_descendant_of(t, ancestor))
            .collect();
        descendants.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
        descendants
    }

    /// Ancestry of a known tenant, root first
    pub fn path_of(&self, tenant_id: &TenantId) -> RbacResult<Vec<TenantId>> {
        path(self.require(tenant_id)?)
    }

    /// Add a newly created tenant under `parent_id`.
    ///
    /// The sub-tenant limit is checked before anything is touched.
    pub fn attach_child(&mut self, parent_id: &TenantId, child: Tenant) -> RbacResult<Tenant> {
        let parent = self.require(parent_id)?;
        ensure_can_attach(parent)?;

        let expected_path = join_path(&parent.tenant_path, &child.id);
        if child.parent_tenant_id.as_ref() != Some(parent_id) || child.tenant_path != expected_path {
            return Err(RbacError::path_mismatch(
                child.id.as_str(),
                &child.tenant_path,
                format!("expected '{}' under parent {}", expected_path, parent_id),
            ));
        }
        path(&child)?;

        if let Some(parent) = self.tenants.get_mut(parent_id) {
            parent.current_sub_tenants += 1;
        }
        debug!(tenant_id = %child.id, parent_id = %parent_id, "Attached sub-tenant");
        self.tenants.insert(child.id.clone(), child.clone());
        Ok(child)
    }

    /// Compose a re-parenting of `tenant_id` under `new_parent` without applying it
    pub fn plan_move(
        &self,
        tenant_id: &TenantId,
        new_parent: Option<&TenantId>,
    ) -> RbacResult<TenantMove> {
        let tenant = self.require(tenant_id)?;
        path(tenant)?;

        if tenant.parent_tenant_id.as_ref() == new_parent {
            return Err(RbacError::invalid_move(tenant_id.as_str(), "tenant is already under that parent"));
        }

        let mut parents = Vec::new();
        let (base_path, base_level) = match new_parent {
            Some(parent_id) => {
                if parent_id == tenant_id {
                    return Err(RbacError::invalid_move(tenant_id.as_str(), "tenant cannot be its own parent"));
                }
                let parent = self.require(parent_id)?;
                if is_descendant_of(parent, tenant) {
                    return Err(RbacError::invalid_move(
                        tenant_id.as_str(),
                        format!("{} is a descendant of the tenant", parent_id),
                    ));
                }
                ensure_can_attach(parent)?;

                let mut parent = parent.clone();
                parent.current_sub_tenants += 1;
                let base = (join_path(&parent.tenant_path, tenant_id), parent.level + 1);
                parents.push(parent);
                base
            }
            None => (tenant_id.to_string(), 0),
        };

        if let Some(old_parent_id) = &tenant.parent_tenant_id {
            let mut old_parent = self.require(old_parent_id)?.clone();
            old_parent.current_sub_tenants = old_parent.current_sub_tenants.saturating_sub(1);
            parents.push(old_parent);
        }

        let old_base = tenant.tenant_path.as_str();
        let mut moved = tenant.clone();
        moved.parent_tenant_id = new_parent.cloned();
        moved.tenant_path = base_path.clone();
        moved.level = base_level;

        let mut subtree = vec![moved];
        for descendant in self.descendants(tenant_id) {
            let suffix = descendant.tenant_path.strip_prefix(old_base).ok_or_else(|| {
                RbacError::path_mismatch(
                    descendant.id.as_str(),
                    &descendant.tenant_path,
                    format!("expected prefix '{}'", old_base),
                )
            })?;
            let mut updated = descendant.clone();
            updated.tenant_path = format!("{}{}", base_path, suffix);
            updated.level = base_level + (descendant.level - tenant.level);
            subtree.push(updated);
        }

        for node in &subtree {
            path(node)?;
        }

        Ok(TenantMove {
            tenant_id: tenant_id.clone(),
            old_parent: tenant.parent_tenant_id.clone(),
            new_parent: new_parent.cloned(),
            subtree,
            parents,
        })
    }

    /// Apply a planned move as one state replacement
    pub fn apply_move(&mut self, planned: TenantMove) -> RbacResult<()> {
        for id in planned.affected_ids() {
            self.require(id)?;
        }

        let mut next = self.tenants.clone();
        for tenant in planned.subtree.into_iter().chain(planned.parents) {
            next.insert(tenant.id.clone(), tenant);
        }
        Self::validate_map(&next)?;

        debug!(tenant_id = %planned.tenant_id, "Applied tenant move");
        self.tenants = next;
        Ok(())
    }

    /// Install a pre-computed subtree as one state replacement.
    ///
    /// The shallowest node is taken as the subtree root; every previously known
    /// descendant of that root is replaced by the supplied nodes.
    pub fn replace_subtree(&mut self, subtree: Vec<Tenant>) -> RbacResult<()> {
        let Some(root) = subtree.iter().min_by_key(|t| t.level) else {
            return Ok(());
        };
        let root_id = root.id.clone();

        let mut next = self.tenants.clone();
        if let Some(previous_root) = self.tenants.get(&root_id) {
            next.retain(|_, t| !is_descendant_of(t, previous_root));
        }
        for tenant in subtree {
            path(&tenant)?;
            next.insert(tenant.id.clone(), tenant);
        }
        Self::validate_map(&next)?;

        self.tenants = next;
        Ok(())
    }

    /// Drop a tenant and its subtree after the external service deleted it
    pub fn remove(&mut self, tenant_id: &TenantId) -> RbacResult<Vec<Tenant>> {
        let tenant = self.require(tenant_id)?.clone();

        let mut next = self.tenants.clone();
        let mut removed = Vec::new();
        next.retain(|_, t| {
            let doomed = t.id == tenant.id || is_descendant_of(t, &tenant);
            if doomed {
                removed.push(t.clone());
            }
            !doomed
        });
        if let Some(parent_id) = &tenant.parent_tenant_id {
            if let Some(parent) = next.get_mut(parent_id) {
                parent.current_sub_tenants = parent.current_sub_tenants.saturating_sub(1);
            }
        }

        self.tenants = next;
        Ok(removed)
    }

    /// Check every tenant's path and its link to a known parent
    pub fn validate(&self) -> RbacResult<()> {
        Self::validate_map(&self.tenants)
    }

    fn validate_map(tenants: &HashMap<TenantId, Tenant>) -> RbacResult<()> {
        for tenant in tenants.values() {
            path(tenant)?;
            Self::check_link(tenant, tenants)?;
        }
        Ok(())
    }

    fn check_link(tenant: &Tenant, tenants: &HashMap<TenantId, Tenant>) -> RbacResult<()> {
        let Some(parent) = tenant
            .parent_tenant_id
            .as_ref()
            .and_then(|parent_id| tenants.get(parent_id))
        else {
            return Ok(());
        };

        let expected = join_path(&parent.tenant_path, &tenant.id);
        if tenant.tenant_path != expected {
            return Err(RbacError::path_mismatch(
                tenant.id.as_str(),
                &tenant.tenant_path,
                format!("parent {} expects '{}'", parent.id, expected),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// acme -> {emea -> {fr, de}, apac}
    fn sample() -> TenantHierarchy {
        let mut acme = Tenant::root("acme", "Acme", 3);
        let mut emea = Tenant::child_of(&acme, "emea", "EMEA", 2);
        let apac = Tenant::child_of(&acme, "apac", "APAC", 2);
        let fr = Tenant::child_of(&emea, "fr", "France", 0);
        let de = Tenant::child_of(&emea, "de", "Germany", 0);
        acme.current_sub_tenants = 2;
        emea.current_sub_tenants = 2;
        TenantHierarchy::from_tenants(vec![acme, emea, apac, fr, de]).unwrap()
    }

    fn id(value: &str) -> TenantId {
        TenantId::from(value)
    }

    #[test]
    fn test_path_matches_level() {
        let hierarchy = sample();
        for tenant_id in ["acme", "emea", "apac", "fr", "de"] {
            let tenant = hierarchy.get(&id(tenant_id)).unwrap();
            let ancestry = path(tenant).unwrap();
            assert_eq!(ancestry.len(), tenant.level as usize + 1);
            assert_eq!(ancestry.last(), Some(&tenant.id));
        }
        assert_eq!(
            hierarchy.path_of(&id("fr")).unwrap(),
            vec![id("acme"), id("emea"), id("fr")]
        );
    }

    #[test]
    fn test_path_rejects_level_mismatch() {
        let mut tenant = Tenant::root("acme", "Acme", 1);
        tenant.level = 2;
        let err = path(&tenant).unwrap_err();
        assert!(err.is_integrity_error());
        assert!(matches!(err, RbacError::LevelMismatch { segments: 1, .. }));
    }

    #[test]
    fn test_path_rejects_foreign_tail() {
        let root = Tenant::root("acme", "Acme", 1);
        let mut child = Tenant::child_of(&root, "emea", "EMEA", 1);
        child.tenant_path = "acme/apac".to_string();
        assert!(matches!(path(&child), Err(RbacError::PathMismatch { .. })));
    }

    #[test]
    fn test_descendant_checks() {
        let hierarchy = sample();
        let acme = hierarchy.get(&id("acme")).unwrap();
        let emea = hierarchy.get(&id("emea")).unwrap();
        let fr = hierarchy.get(&id("fr")).unwrap();
        let apac = hierarchy.get(&id("apac")).unwrap();

        assert!(is_descendant_of(fr, acme));
        assert!(is_descendant_of(fr, emea));
        assert!(!is_descendant_of(fr, apac));
        assert!(!is_descendant_of(emea, emea));
        assert!(!is_descendant_of(acme, fr));
    }

    #[test]
    fn test_descendant_check_is_segment_wise() {
        let root = Tenant::root("org", "Org", 2);
        let org2 = Tenant::root("org2", "Org 2", 2);
        let child = Tenant::child_of(&org2, "team", "Team", 0);
        assert!(!is_descendant_of(&child, &root));
    }

    #[test]
    fn test_can_attach_child() {
        let hierarchy = sample();
        assert!(can_attach_child(hierarchy.get(&id("acme")).unwrap()));
        assert!(!can_attach_child(hierarchy.get(&id("emea")).unwrap()));
        assert!(!can_attach_child(hierarchy.get(&id("fr")).unwrap()));

        let mut inactive = Tenant::root("old", "Old", 10);
        inactive.is_active = false;
        assert!(!can_attach_child(&inactive));
    }

    #[test]
    fn test_attach_child_at_limit_leaves_hierarchy_untouched() {
        let mut hierarchy = sample();
        let emea = hierarchy.get(&id("emea")).unwrap().clone();
        let it = Tenant::child_of(&emea, "it", "Italy", 0);

        let err = hierarchy.attach_child(&id("emea"), it).unwrap_err();
        assert!(matches!(err, RbacError::SubTenantLimitExceeded { max_sub_tenants: 2, .. }));
        assert!(hierarchy.get(&id("it")).is_none());
        assert_eq!(hierarchy.get(&id("emea")).unwrap().current_sub_tenants, 2);
    }

    #[test]
    fn test_attach_child_increments_parent() {
        let mut hierarchy = sample();
        let acme = hierarchy.get(&id("acme")).unwrap().clone();
        let latam = Tenant::child_of(&acme, "latam", "LATAM", 1);

        hierarchy.attach_child(&id("acme"), latam).unwrap();
        assert_eq!(hierarchy.get(&id("acme")).unwrap().current_sub_tenants, 3);
        assert_eq!(hierarchy.children(&id("acme")).len(), 3);
    }

    #[test]
    fn test_move_recomputes_subtree() {
        let mut hierarchy = sample();
        let planned = hierarchy.plan_move(&id("emea"), Some(&id("apac"))).unwrap();

        // Planning alone changes nothing
        assert_eq!(hierarchy.get(&id("fr")).unwrap().tenant_path, "acme/emea/fr");

        hierarchy.apply_move(planned).unwrap();

        let apac_path = hierarchy.path_of(&id("apac")).unwrap();
        let mut expected = apac_path.clone();
        expected.push(id("emea"));
        assert_eq!(hierarchy.path_of(&id("emea")).unwrap(), expected);

        let fr = hierarchy.get(&id("fr")).unwrap();
        assert_eq!(fr.tenant_path, "acme/apac/emea/fr");
        assert_eq!(fr.level, 3);
        assert_eq!(hierarchy.get(&id("de")).unwrap().tenant_path, "acme/apac/emea/de");

        assert_eq!(hierarchy.get(&id("acme")).unwrap().current_sub_tenants, 1);
        assert_eq!(hierarchy.get(&id("apac")).unwrap().current_sub_tenants, 1);
        hierarchy.validate().unwrap();
    }

    #[test]
    fn test_move_to_root() {
        let mut hierarchy = sample();
        let planned = hierarchy.plan_move(&id("emea"), None).unwrap();
        hierarchy.apply_move(planned).unwrap();

        let emea = hierarchy.get(&id("emea")).unwrap();
        assert!(emea.is_root());
        assert_eq!(emea.level, 0);
        assert_eq!(hierarchy.get(&id("de")).unwrap().tenant_path, "emea/de");
        assert_eq!(hierarchy.roots().len(), 2);
    }

    #[test]
    fn test_move_under_own_descendant_rejected() {
        let hierarchy = sample();
        let err = hierarchy.plan_move(&id("emea"), Some(&id("fr"))).unwrap_err();
        assert!(matches!(err, RbacError::InvalidMove { .. }));

        let err = hierarchy.plan_move(&id("emea"), Some(&id("emea"))).unwrap_err();
        assert!(matches!(err, RbacError::InvalidMove { .. }));
    }

    #[test]
    fn test_move_under_full_parent_rejected() {
        let hierarchy = sample();
        let err = hierarchy.plan_move(&id("apac"), Some(&id("emea"))).unwrap_err();
        assert!(matches!(err, RbacError::SubTenantLimitExceeded { .. }));
    }

    #[test]
    fn test_replace_subtree_drops_stale_nodes() {
        let mut hierarchy = sample();
        let emea = hierarchy.get(&id("emea")).unwrap().clone();
        let fr = hierarchy.get(&id("fr")).unwrap().clone();

        let mut fresh_emea = emea.clone();
        fresh_emea.current_sub_tenants = 1;
        hierarchy.replace_subtree(vec![fresh_emea, fr]).unwrap();

        assert!(hierarchy.get(&id("de")).is_none());
        assert!(hierarchy.get(&id("fr")).is_some());
        assert_eq!(hierarchy.len(), 4);
    }

    #[test]
    fn test_replace_subtree_rejects_inconsistent_node() {
        let mut hierarchy = sample();
        let mut fr = hierarchy.get(&id("fr")).unwrap().clone();
        fr.parent_tenant_id = Some(id("apac"));

        let emea = hierarchy.get(&id("emea")).unwrap().clone();
        let err = hierarchy.replace_subtree(vec![emea, fr]).unwrap_err();
        assert!(err.is_integrity_error());

        // Nothing was installed
        assert_eq!(hierarchy.len(), 5);
        assert_eq!(
            hierarchy.get(&id("fr")).unwrap().parent_tenant_id,
            Some(id("emea"))
        );
    }

    #[test]
    fn test_remove_subtree() {
        let mut hierarchy = sample();
        let removed = hierarchy.remove(&id("emea")).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(hierarchy.get(&id("fr")).is_none());
        assert_eq!(hierarchy.get(&id("acme")).unwrap().current_sub_tenants, 1);
    }

    #[test]
    fn test_update_cannot_reparent() {
        let mut hierarchy = sample();
        let mut apac = hierarchy.get(&id("apac")).unwrap().clone();
        apac.name = "Asia Pacific".to_string();
        hierarchy.update(apac.clone()).unwrap();
        assert_eq!(hierarchy.get(&id("apac")).unwrap().name, "Asia Pacific");

        apac.tenant_path = "apac".to_string();
        apac.level = 0;
        apac.parent_tenant_id = None;
        assert!(hierarchy.update(apac).is_err());
    }
}

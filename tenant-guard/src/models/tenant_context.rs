use crate::models::membership::MemberRole;
use crate::models::permission::PermissionSet;
use serde::Serialize;
use std::sync::Arc;

/// Per-request tenant binding. Immutable once resolved; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct TenantContext {
    pub organization_id: String,
    pub user_id: String,
    pub role: MemberRole,
    #[serde(skip)]
    pub permissions: Arc<PermissionSet>,
}

impl TenantContext {
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        role: MemberRole,
        permissions: Arc<PermissionSet>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            role,
            permissions,
        }
    }

    /// Wildcard-aware check against the resolved set. Conditional grants
    /// need the permission engine.
    pub fn has_permission(&self, resource: &str, action: &str) -> bool {
        self.permissions.grants(resource, action).is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin_or_owner()
    }

    pub fn scope(&self) -> TenantScope {
        TenantScope {
            user_id: self.user_id.clone(),
            organization_id: self.organization_id.clone(),
            role: Some(self.role),
        }
    }
}

/// Arguments of the datastore's session-context call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub user_id: String,
    pub organization_id: String,
    pub role: Option<MemberRole>,
}

impl TenantScope {
    pub fn new(user_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            role: None,
        }
    }
}

//! Collaborator seams. The core only talks to the datastore and identity
//! provider through these traits.
//!
//! Lookups needed to establish a tenant (credentials, membership, permission
//! RPC, directory) run unscoped. Everything a request reads or writes after
//! isolation is set goes through the [`ScopedSession`] opened for it.

use crate::models::{
    ApiKey, AuditFilters, AuditLog, AuditPage, IsolatedTable, Membership, Organization, Project,
    SecuritySignals, TenantScope, UserAccount, Workspace,
};
use async_trait::async_trait;
use serde_json::Value;

/// Identity established from a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok(None)` for a credential that is well-formed but not accepted.
    async fn verify(&self, token: &str) -> Result<Option<VerifiedIdentity>, anyhow::Error>;
}

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<Membership>, anyhow::Error>;
}

#[async_trait]
pub trait PermissionRpc: Send + Sync {
    /// Role defaults plus custom grants, resolved server-side.
    async fn effective_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Vec<String>, anyhow::Error>;
}

#[async_trait]
pub trait ConditionStore: Send + Sync {
    /// Raw stored conditions attached to a conditional grant of `permission`.
    async fn find_conditions(
        &self,
        organization_id: &str,
        user_id: &str,
        permission: &str,
    ) -> Result<Vec<Value>, anyhow::Error>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserAccount>, anyhow::Error>;

    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<Organization>, anyhow::Error>;

    async fn find_workspace(&self, workspace_id: &str)
        -> Result<Option<Workspace>, anyhow::Error>;

    async fn is_workspace_member(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<bool, anyhow::Error>;

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>, anyhow::Error>;

    async fn is_project_member(&self, project_id: &str, user_id: &str)
        -> Result<bool, anyhow::Error>;

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, anyhow::Error>;

    async fn touch_api_key(&self, key_id: &str) -> Result<(), anyhow::Error>;

    async fn security_signals(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<SecuritySignals, anyhow::Error>;
}

/// Opens tenant-bound sessions and answers the unscoped isolation checks.
#[async_trait]
pub trait TenantSession: Send + Sync {
    /// Dedicated connection with the tenant settings applied. It stays bound
    /// to `scope` until released.
    async fn begin_scope(&self, scope: &TenantScope)
        -> Result<Box<dyn ScopedSession>, anyhow::Error>;

    /// Whether row-level isolation is switched on for the tenant tables.
    async fn isolation_enabled(&self) -> Result<bool, anyhow::Error>;

    /// Some organization other than `organization_id`, used as the foreign canary.
    async fn find_foreign_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<String>, anyhow::Error>;
}

/// One connection bound to one tenant. Row policies filter every query on it
/// by the scope it was opened with.
#[async_trait]
pub trait ScopedSession: Send {
    fn scope(&self) -> &TenantScope;

    async fn find_membership(&mut self, user_id: &str)
        -> Result<Option<Membership>, anyhow::Error>;

    async fn list_memberships(&mut self) -> Result<Vec<Membership>, anyhow::Error>;

    async fn save_membership(&mut self, membership: &Membership) -> Result<(), anyhow::Error>;

    /// Newest-first page matching `filters`.
    async fn query_audit_logs(&mut self, filters: &AuditFilters)
        -> Result<AuditPage, anyhow::Error>;

    /// Organization ids visible on this connection.
    async fn visible_organization_ids(&mut self) -> Result<Vec<String>, anyhow::Error>;

    /// Rows of `table` owned by `target_organization_id` visible on this connection.
    async fn count_rows_for_organization(
        &mut self,
        table: IsolatedTable,
        target_organization_id: &str,
    ) -> Result<i64, anyhow::Error>;

    /// Rows of `table` visible on this connection that belong to another organization.
    async fn count_cross_tenant_rows(&mut self, table: IsolatedTable)
        -> Result<i64, anyhow::Error>;

    /// Clear the tenant settings and hand the connection back.
    async fn release(self: Box<Self>) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert_batch(&self, logs: &[AuditLog]) -> Result<(), anyhow::Error>;
}

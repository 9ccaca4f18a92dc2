//! In-memory datastore implementing every collaborator trait. Used by tests
//! and local development.
//!
//! Scoped sessions share the datastore's state and record which handle served
//! each call, so tests can check that a request never strays off its own
//! connection.

use crate::models::{
    ApiKey, AuditFilters, AuditLog, AuditPage, IsolatedTable, Membership, Organization, Project,
    SecuritySignals, TenantScope, UserAccount, Workspace,
};
use crate::services::store::{
    AuditSink, ConditionStore, CredentialVerifier, MembershipStore, PermissionRpc,
    ScopedSession, TenantDirectory, TenantSession, VerifiedIdentity,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockDatastore {
    state: Arc<MockState>,
}

impl MockDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deref for MockDatastore {
    type Target = MockState;

    fn deref(&self) -> &MockState {
        &self.state
    }
}

pub struct MockState {
    pub tokens: Mutex<HashMap<String, VerifiedIdentity>>,
    pub users: Mutex<HashMap<String, UserAccount>>,
    pub organizations: Mutex<HashMap<String, Organization>>,
    pub memberships: Mutex<HashMap<(String, String), Membership>>,
    pub workspaces: Mutex<HashMap<String, Workspace>>,
    pub workspace_members: Mutex<HashSet<(String, String)>>,
    pub projects: Mutex<HashMap<String, Project>>,
    pub project_members: Mutex<HashSet<(String, String)>>,
    pub api_keys: Mutex<HashMap<String, ApiKey>>,
    pub signals: Mutex<HashMap<(String, String), SecuritySignals>>,
    pub conditions: Mutex<HashMap<(String, String, String), Vec<Value>>>,
    /// Billing rows per organization.
    pub billing: Mutex<HashMap<String, i64>>,
    pub audit_rows: Mutex<Vec<AuditLog>>,
    pub sessions: Mutex<Vec<TenantScope>>,
    /// `(handle, operation)` for every call made on a scoped session.
    pub scoped_calls: Mutex<Vec<(usize, &'static str)>>,
    pub handles_opened: AtomicUsize,
    pub handles_released: AtomicUsize,
    pub rpc_calls: AtomicUsize,
    pub insert_attempts: AtomicUsize,
    fail_rpc: AtomicBool,
    fail_inserts: AtomicUsize,
    isolation_enabled: AtomicBool,
    leak_rows: AtomicBool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            organizations: Mutex::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
            workspace_members: Mutex::new(HashSet::new()),
            projects: Mutex::new(HashMap::new()),
            project_members: Mutex::new(HashSet::new()),
            api_keys: Mutex::new(HashMap::new()),
            signals: Mutex::new(HashMap::new()),
            conditions: Mutex::new(HashMap::new()),
            billing: Mutex::new(HashMap::new()),
            audit_rows: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            scoped_calls: Mutex::new(Vec::new()),
            handles_opened: AtomicUsize::new(0),
            handles_released: AtomicUsize::new(0),
            rpc_calls: AtomicUsize::new(0),
            insert_attempts: AtomicUsize::new(0),
            fail_rpc: AtomicBool::new(false),
            fail_inserts: AtomicUsize::new(0),
            isolation_enabled: AtomicBool::new(true),
            leak_rows: AtomicBool::new(false),
        }
    }
}

impl MockState {
    pub fn add_token(&self, token: &str, user_id: &str) {
        guard(&self.tokens).insert(
            token.to_string(),
            VerifiedIdentity {
                user_id: user_id.to_string(),
                email: None,
            },
        );
    }

    pub fn add_user(&self, user: UserAccount) {
        guard(&self.users).insert(user.id.clone(), user);
    }

    pub fn add_organization(&self, organization: Organization) {
        guard(&self.organizations).insert(organization.id.clone(), organization);
    }

    pub fn add_membership(&self, membership: Membership) {
        guard(&self.memberships).insert(
            (
                membership.user_id.clone(),
                membership.organization_id.clone(),
            ),
            membership,
        );
    }

    pub fn add_workspace(&self, workspace: Workspace, members: &[&str]) {
        let mut ws_members = guard(&self.workspace_members);
        for user in members {
            ws_members.insert((workspace.id.clone(), user.to_string()));
        }
        guard(&self.workspaces).insert(workspace.id.clone(), workspace);
    }

    pub fn add_project(&self, project: Project, members: &[&str]) {
        let mut p_members = guard(&self.project_members);
        for user in members {
            p_members.insert((project.id.clone(), user.to_string()));
        }
        guard(&self.projects).insert(project.id.clone(), project);
    }

    pub fn add_api_key(&self, key: ApiKey) {
        guard(&self.api_keys).insert(key.key_hash.clone(), key);
    }

    pub fn set_signals(&self, user_id: &str, organization_id: &str, signals: SecuritySignals) {
        guard(&self.signals).insert(
            (user_id.to_string(), organization_id.to_string()),
            signals,
        );
    }

    pub fn add_conditions(
        &self,
        organization_id: &str,
        user_id: &str,
        permission: &str,
        conditions: Vec<Value>,
    ) {
        guard(&self.conditions).insert(
            (
                organization_id.to_string(),
                user_id.to_string(),
                permission.to_string(),
            ),
            conditions,
        );
    }

    pub fn add_billing_rows(&self, organization_id: &str, rows: i64) {
        *guard(&self.billing)
            .entry(organization_id.to_string())
            .or_insert(0) += rows;
    }

    pub fn membership(&self, user_id: &str, organization_id: &str) -> Option<Membership> {
        guard(&self.memberships)
            .get(&(user_id.to_string(), organization_id.to_string()))
            .cloned()
    }

    pub fn audit_logs(&self) -> Vec<AuditLog> {
        guard(&self.audit_rows).clone()
    }

    pub fn session_scopes(&self) -> Vec<TenantScope> {
        guard(&self.sessions).clone()
    }

    pub fn scoped_calls(&self) -> Vec<(usize, &'static str)> {
        guard(&self.scoped_calls).clone()
    }

    pub fn handles_opened(&self) -> usize {
        self.handles_opened.load(Ordering::SeqCst)
    }

    pub fn handles_released(&self) -> usize {
        self.handles_released.load(Ordering::SeqCst)
    }

    pub fn rpc_call_count(&self) -> usize {
        self.rpc_calls.load(Ordering::SeqCst)
    }

    pub fn set_rpc_failing(&self, failing: bool) {
        self.fail_rpc.store(failing, Ordering::SeqCst);
    }

    /// The next `count` audit inserts fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.fail_inserts.store(count, Ordering::SeqCst);
    }

    pub fn set_isolation_enabled(&self, enabled: bool) {
        self.isolation_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Simulates policies that stop filtering rows by tenant.
    pub fn set_leaking(&self, leaking: bool) {
        self.leak_rows.store(leaking, Ordering::SeqCst);
    }

    fn filtering(&self) -> bool {
        self.isolation_enabled.load(Ordering::SeqCst) && !self.leak_rows.load(Ordering::SeqCst)
    }

    /// Owning organization of every row in `table`.
    fn row_owners(&self, table: IsolatedTable) -> Vec<String> {
        match table {
            IsolatedTable::Organizations => guard(&self.organizations).keys().cloned().collect(),
            IsolatedTable::Workspaces => guard(&self.workspaces)
                .values()
                .map(|w| w.organization_id.clone())
                .collect(),
            IsolatedTable::Members => guard(&self.memberships)
                .values()
                .map(|m| m.organization_id.clone())
                .collect(),
            IsolatedTable::AuditLogs => guard(&self.audit_rows)
                .iter()
                .filter_map(|l| l.organization_id.clone())
                .collect(),
            IsolatedTable::Billing => guard(&self.billing)
                .iter()
                .flat_map(|(org, rows)| {
                    std::iter::repeat(org.clone()).take((*rows).max(0) as usize)
                })
                .collect(),
        }
    }
}

#[async_trait]
impl CredentialVerifier for MockDatastore {
    async fn verify(&self, token: &str) -> Result<Option<VerifiedIdentity>, anyhow::Error> {
        Ok(guard(&self.tokens).get(token).cloned())
    }
}

#[async_trait]
impl MembershipStore for MockDatastore {
    async fn find_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<Membership>, anyhow::Error> {
        Ok(self.membership(user_id, organization_id))
    }
}

#[async_trait]
impl PermissionRpc for MockDatastore {
    async fn effective_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Vec<String>, anyhow::Error> {
        self.rpc_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_rpc.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("permission rpc unavailable"));
        }
        Ok(self
            .membership(user_id, organization_id)
            .filter(Membership::is_active)
            .map(|m| m.effective_permissions())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ConditionStore for MockDatastore {
    async fn find_conditions(
        &self,
        organization_id: &str,
        user_id: &str,
        permission: &str,
    ) -> Result<Vec<Value>, anyhow::Error> {
        Ok(guard(&self.conditions)
            .get(&(
                organization_id.to_string(),
                user_id.to_string(),
                permission.to_string(),
            ))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TenantDirectory for MockDatastore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserAccount>, anyhow::Error> {
        Ok(guard(&self.users).get(user_id).cloned())
    }

    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<Organization>, anyhow::Error> {
        Ok(guard(&self.organizations).get(organization_id).cloned())
    }

    async fn find_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Workspace>, anyhow::Error> {
        Ok(guard(&self.workspaces).get(workspace_id).cloned())
    }

    async fn is_workspace_member(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<bool, anyhow::Error> {
        Ok(guard(&self.workspace_members)
            .contains(&(workspace_id.to_string(), user_id.to_string())))
    }

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>, anyhow::Error> {
        Ok(guard(&self.projects).get(project_id).cloned())
    }

    async fn is_project_member(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<bool, anyhow::Error> {
        Ok(guard(&self.project_members).contains(&(project_id.to_string(), user_id.to_string())))
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, anyhow::Error> {
        Ok(guard(&self.api_keys).get(key_hash).cloned())
    }

    async fn touch_api_key(&self, key_id: &str) -> Result<(), anyhow::Error> {
        let mut keys = guard(&self.api_keys);
        if let Some(key) = keys.values_mut().find(|k| k.id == key_id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn security_signals(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<SecuritySignals, anyhow::Error> {
        Ok(guard(&self.signals)
            .get(&(user_id.to_string(), organization_id.to_string()))
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl TenantSession for MockDatastore {
    async fn begin_scope(
        &self,
        scope: &TenantScope,
    ) -> Result<Box<dyn ScopedSession>, anyhow::Error> {
        guard(&self.sessions).push(scope.clone());
        let handle = self.handles_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockScopedSession {
            state: self.state.clone(),
            scope: scope.clone(),
            handle,
        }))
    }

    async fn isolation_enabled(&self) -> Result<bool, anyhow::Error> {
        Ok(self.isolation_enabled.load(Ordering::SeqCst))
    }

    async fn find_foreign_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<String>, anyhow::Error> {
        let mut others: Vec<String> = guard(&self.organizations)
            .keys()
            .filter(|id| id.as_str() != organization_id)
            .cloned()
            .collect();
        others.sort();
        Ok(others.into_iter().next())
    }
}

#[async_trait]
impl AuditSink for MockDatastore {
    async fn insert_batch(&self, logs: &[AuditLog]) -> Result<(), anyhow::Error> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_inserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_inserts.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow::anyhow!("audit sink unavailable"));
        }
        guard(&self.audit_rows).extend_from_slice(logs);
        Ok(())
    }
}

/// Session handed out by [`MockDatastore::begin_scope`]. Handles count up from 1.
pub struct MockScopedSession {
    state: Arc<MockState>,
    scope: TenantScope,
    handle: usize,
}

impl MockScopedSession {
    fn record(&self, operation: &'static str) {
        guard(&self.state.scoped_calls).push((self.handle, operation));
    }

    fn owns(&self, organization_id: &str) -> bool {
        !self.state.filtering() || organization_id == self.scope.organization_id
    }
}

#[async_trait]
impl ScopedSession for MockScopedSession {
    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn find_membership(
        &mut self,
        user_id: &str,
    ) -> Result<Option<Membership>, anyhow::Error> {
        self.record("find_membership");
        Ok(self.state.membership(user_id, &self.scope.organization_id))
    }

    async fn list_memberships(&mut self) -> Result<Vec<Membership>, anyhow::Error> {
        self.record("list_memberships");
        let mut members: Vec<Membership> = guard(&self.state.memberships)
            .values()
            .filter(|m| m.organization_id == self.scope.organization_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(members)
    }

    async fn save_membership(&mut self, membership: &Membership) -> Result<(), anyhow::Error> {
        self.record("save_membership");
        if !self.owns(&membership.organization_id) {
            return Err(anyhow::anyhow!("row violates tenant policy"));
        }
        self.state.add_membership(membership.clone());
        Ok(())
    }

    async fn query_audit_logs(
        &mut self,
        filters: &AuditFilters,
    ) -> Result<AuditPage, anyhow::Error> {
        self.record("query_audit_logs");
        let mut matching: Vec<AuditLog> = guard(&self.state.audit_rows)
            .iter()
            .filter(|log| {
                log.organization_id
                    .as_deref()
                    .map_or(!self.state.filtering(), |org| self.owns(org))
            })
            .filter(|log| filters.matches(log))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let logs = matching
            .into_iter()
            .skip(filters.offset.max(0) as usize)
            .take(filters.limit.max(0) as usize)
            .collect();

        Ok(AuditPage {
            logs,
            total,
            limit: filters.limit,
            offset: filters.offset,
        })
    }

    async fn visible_organization_ids(&mut self) -> Result<Vec<String>, anyhow::Error> {
        self.record("visible_organization_ids");
        let mut ids: Vec<String> = guard(&self.state.organizations)
            .keys()
            .filter(|id| self.owns(id))
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn count_rows_for_organization(
        &mut self,
        table: IsolatedTable,
        target_organization_id: &str,
    ) -> Result<i64, anyhow::Error> {
        self.record("count_rows_for_organization");
        if !self.owns(target_organization_id) {
            return Ok(0);
        }
        Ok(self
            .state
            .row_owners(table)
            .iter()
            .filter(|owner| owner.as_str() == target_organization_id)
            .count() as i64)
    }

    async fn count_cross_tenant_rows(
        &mut self,
        table: IsolatedTable,
    ) -> Result<i64, anyhow::Error> {
        self.record("count_cross_tenant_rows");
        Ok(self
            .state
            .row_owners(table)
            .iter()
            .filter(|owner| **owner != self.scope.organization_id && self.owns(owner))
            .count() as i64)
    }

    async fn release(self: Box<Self>) -> Result<(), anyhow::Error> {
        self.record("release");
        self.state.handles_released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemberRole;

    #[tokio::test]
    async fn test_rpc_counts_calls_and_hides_inactive() {
        let store = MockDatastore::new();
        store.add_membership(
            Membership::new("u1", "o1", MemberRole::Viewer)
                .with_status(crate::models::MembershipStatus::Suspended),
        );
        let perms = store.effective_permissions("u1", "o1").await.unwrap();
        assert!(perms.is_empty());
        assert_eq!(store.rpc_call_count(), 1);
    }

    #[tokio::test]
    async fn test_leak_exposes_foreign_rows() {
        let store = MockDatastore::new();
        store.add_organization(Organization::new("a", "A"));
        store.add_organization(Organization::new("b", "B"));
        store.add_billing_rows("b", 2);
        let mut session = store
            .begin_scope(&TenantScope::new("u1", "a"))
            .await
            .unwrap();

        assert_eq!(
            session
                .count_cross_tenant_rows(IsolatedTable::Billing)
                .await
                .unwrap(),
            0
        );
        store.set_leaking(true);
        assert_eq!(
            session
                .count_cross_tenant_rows(IsolatedTable::Billing)
                .await
                .unwrap(),
            2
        );
        session.release().await.unwrap();
        assert_eq!(store.handles_released(), 1);
    }

    #[tokio::test]
    async fn test_scoped_sessions_get_distinct_handles() {
        let store = MockDatastore::new();
        store.add_membership(Membership::new("u1", "a", MemberRole::Admin));
        store.add_membership(Membership::new("u2", "b", MemberRole::Admin));

        let mut first = store.begin_scope(&TenantScope::new("u1", "a")).await.unwrap();
        let mut second = store.begin_scope(&TenantScope::new("u2", "b")).await.unwrap();
        let listed = first.list_memberships().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_id, "u1");
        assert!(second.find_membership("u1").await.unwrap().is_none());

        assert_eq!(
            store.scoped_calls(),
            vec![(1, "list_memberships"), (2, "find_membership")]
        );
        assert_eq!(store.session_scopes().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_failure_injection() {
        let store = MockDatastore::new();
        store.fail_next_inserts(1);
        assert!(store.insert_batch(&[]).await.is_err());
        assert!(store.insert_batch(&[]).await.is_ok());
        assert_eq!(store.insert_attempts.load(Ordering::SeqCst), 2);
    }
}

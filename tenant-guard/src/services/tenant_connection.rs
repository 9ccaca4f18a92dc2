//! Request-scoped handle on the tenant-bound datastore session.
//!
//! Isolation enforcement opens one of these per request. Every tenant-scoped
//! read or write a handler makes goes through it, so the statements run on
//! the same connection that carries the request's tenant settings.

use crate::models::{AuditFilters, AuditPage, IsolatedTable, Membership, TenantScope};
use crate::services::error::TenancyError;
use crate::services::store::{ScopedSession, TenantSession};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct TenantConnection {
    scope: Arc<TenantScope>,
    session: Arc<Mutex<Option<Box<dyn ScopedSession>>>>,
}

impl fmt::Debug for TenantConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantConnection")
            .field("user_id", &self.scope.user_id)
            .field("organization_id", &self.scope.organization_id)
            .finish_non_exhaustive()
    }
}

fn released() -> TenancyError {
    TenancyError::IsolationFailure {
        issues: vec!["Tenant connection already released".to_string()],
    }
}

impl TenantConnection {
    pub async fn open(
        session: &dyn TenantSession,
        scope: TenantScope,
    ) -> Result<Self, TenancyError> {
        let scoped = session.begin_scope(&scope).await?;
        Ok(Self {
            scope: Arc::new(scope),
            session: Arc::new(Mutex::new(Some(scoped))),
        })
    }

    pub fn scope(&self) -> &TenantScope {
        &self.scope
    }

    pub fn organization_id(&self) -> &str {
        &self.scope.organization_id
    }

    pub async fn find_membership(
        &self,
        user_id: &str,
    ) -> Result<Option<Membership>, TenancyError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session.find_membership(user_id).await?)
    }

    pub async fn list_memberships(&self) -> Result<Vec<Membership>, TenancyError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session.list_memberships().await?)
    }

    pub async fn save_membership(&self, membership: &Membership) -> Result<(), TenancyError> {
        if membership.organization_id != self.scope.organization_id {
            return Err(TenancyError::AccessDenied(
                "Membership belongs to another organization".to_string(),
            ));
        }
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session.save_membership(membership).await?)
    }

    /// Audit rows for this connection's organization. Pagination is clamped
    /// and any organization filter is replaced by the scope's own.
    pub async fn query_audit_logs(&self, filters: AuditFilters) -> Result<AuditPage, TenancyError> {
        let filters = AuditFilters {
            organization_id: Some(self.scope.organization_id.clone()),
            ..filters.normalized()
        };
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session.query_audit_logs(&filters).await?)
    }

    pub async fn visible_organization_ids(&self) -> Result<Vec<String>, TenancyError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session.visible_organization_ids().await?)
    }

    pub async fn count_rows_for_organization(
        &self,
        table: IsolatedTable,
        target_organization_id: &str,
    ) -> Result<i64, TenancyError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session
            .count_rows_for_organization(table, target_organization_id)
            .await?)
    }

    pub async fn count_cross_tenant_rows(&self, table: IsolatedTable) -> Result<i64, TenancyError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or_else(released)?;
        Ok(session.count_cross_tenant_rows(table).await?)
    }

    /// Hand the connection back. Later calls, on this handle or any clone,
    /// fail closed. Releasing twice is a no-op.
    pub async fn release(&self) -> Result<(), TenancyError> {
        let taken = self.session.lock().await.take();
        match taken {
            Some(session) => Ok(session.release().await?),
            None => Ok(()),
        }
    }

    pub async fn is_released(&self) -> bool {
        self.session.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MemberRole, Organization};
    use crate::services::memory::MockDatastore;

    fn seeded() -> MockDatastore {
        let store = MockDatastore::new();
        store.add_organization(Organization::new("org-a", "A"));
        store.add_organization(Organization::new("org-b", "B"));
        store.add_membership(Membership::new("user-1", "org-a", MemberRole::Admin));
        store.add_membership(Membership::new("user-2", "org-b", MemberRole::Admin));
        store
    }

    #[tokio::test]
    async fn test_calls_share_one_handle() {
        let store = seeded();
        let conn = TenantConnection::open(&store, TenantScope::new("user-1", "org-a"))
            .await
            .unwrap();
        let clone = conn.clone();

        assert_eq!(conn.list_memberships().await.unwrap().len(), 1);
        assert!(clone.find_membership("user-1").await.unwrap().is_some());
        conn.release().await.unwrap();

        let handles: Vec<usize> = store.scoped_calls().iter().map(|(h, _)| *h).collect();
        assert_eq!(handles, vec![1, 1, 1]);
        assert_eq!(store.handles_opened(), 1);
        assert_eq!(store.handles_released(), 1);
    }

    #[tokio::test]
    async fn test_released_connection_fails_closed() {
        let store = seeded();
        let conn = TenantConnection::open(&store, TenantScope::new("user-1", "org-a"))
            .await
            .unwrap();
        conn.release().await.unwrap();
        conn.release().await.unwrap();

        assert!(conn.is_released().await);
        let err = conn.list_memberships().await.unwrap_err();
        assert!(matches!(err, TenancyError::IsolationFailure { .. }));
        assert_eq!(store.handles_released(), 1);
    }

    #[tokio::test]
    async fn test_foreign_membership_write_is_refused() {
        let store = seeded();
        let conn = TenantConnection::open(&store, TenantScope::new("user-1", "org-a"))
            .await
            .unwrap();
        let foreign = Membership::new("user-2", "org-b", MemberRole::Viewer);

        let err = conn.save_membership(&foreign).await.unwrap_err();
        assert!(matches!(err, TenancyError::AccessDenied(_)));
        assert_eq!(
            store.membership("user-2", "org-b").unwrap().role,
            MemberRole::Admin
        );
    }

    #[tokio::test]
    async fn test_audit_query_is_pinned_to_scope() {
        let store = seeded();
        let conn = TenantConnection::open(&store, TenantScope::new("user-1", "org-a"))
            .await
            .unwrap();
        let page = conn
            .query_audit_logs(AuditFilters::for_organization("org-b"))
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(store.scoped_calls(), vec![(1, "query_audit_logs")]);
    }
}

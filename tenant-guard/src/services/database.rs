//! PostgreSQL datastore.
//!
//! Tenant tables are protected by row-level security policies that read the
//! `app.current_*` settings. The pool role must not be a superuser or table
//! owner, otherwise the policies (and the canaries) are bypassed.
//!
//! Each request holds one pooled connection with the settings applied at
//! session level. They are cleared when the request releases it, and again
//! on every checkout so a connection dropped mid-request never carries a
//! tenant into the next one.

use crate::models::{
    ActionFilter, ActorType, ApiKey, AuditFilters, AuditLog, AuditPage, AuditResult,
    IsolatedTable, MemberRole, Membership, MembershipStatus, Organization, Project,
    SecuritySignals, TenantScope, UserAccount, Workspace,
};
use crate::services::store::{
    AuditSink, ConditionStore, MembershipStore, PermissionRpc, ScopedSession, TenantDirectory,
    TenantSession,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use service_core::error::AppError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{info, instrument, warn};

const APPLY_TENANT_SQL: &str = "SELECT set_config('app.current_user_id', $1, false), \
     set_config('app.current_organization_id', $2, false), \
     set_config('app.current_role', $3, false)";

const CLEAR_TENANT_SQL: &str = "SELECT set_config('app.current_user_id', '', false), \
     set_config('app.current_organization_id', '', false), \
     set_config('app.current_role', '', false)";

#[derive(Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

#[derive(FromRow)]
struct MembershipRow {
    user_id: String,
    organization_id: String,
    role: String,
    status: String,
    permissions: Option<Json<Vec<String>>>,
    custom_permissions: Option<Json<Vec<String>>>,
    joined_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = anyhow::Error;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(Membership {
            role: row.role.parse::<MemberRole>().map_err(|e| anyhow::anyhow!(e))?,
            status: row
                .status
                .parse::<MembershipStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
            user_id: row.user_id,
            organization_id: row.organization_id,
            permissions: row.permissions.map(|j| j.0).unwrap_or_default(),
            custom_permissions: row.custom_permissions.map(|j| j.0).unwrap_or_default(),
            joined_at: row.joined_at,
            updated_at: row.updated_at,
        })
    }
}

const MEMBERSHIP_COLUMNS: &str = "user_id::text AS user_id, organization_id::text AS organization_id, \
     role, status, permissions, custom_permissions, joined_at, updated_at";

const AUDIT_COLUMNS: &str = "id, organization_id::text AS organization_id, actor_id::text AS actor_id, \
     actor_type, action, resource_type, resource_id, resource_name, changes, metadata, result, \
     error_message, ip_address::text AS ip_address, user_agent, created_at";

fn audit_from_row(row: &PgRow) -> Result<AuditLog, anyhow::Error> {
    let actor_type: String = row.try_get("actor_type")?;
    let result: String = row.try_get("result")?;
    Ok(AuditLog {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        actor_id: row.try_get("actor_id")?,
        actor_type: actor_type.parse::<ActorType>().map_err(|e| anyhow::anyhow!(e))?,
        action: row.try_get("action")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        resource_name: row.try_get("resource_name")?,
        changes: row.try_get("changes")?,
        metadata: row.try_get("metadata")?,
        result: result.parse::<AuditResult>().map_err(|e| anyhow::anyhow!(e))?,
        error_message: row.try_get("error_message")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        created_at: row.try_get("created_at")?,
    })
}

fn organization_column(table: IsolatedTable) -> &'static str {
    match table {
        IsolatedTable::Organizations => "id",
        _ => "organization_id",
    }
}

impl PgDatastore {
    #[instrument(skip(database_url), fields(service = "tenant-guard"))]
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        info!(max_connections = max_connections, "Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .before_acquire(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query(CLEAR_TENANT_SQL).execute(&mut *conn).await?;
                    Ok(true)
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MembershipStore for PgDatastore {
    async fn find_membership(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Option<Membership>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM organization_members WHERE user_id::text = $1 AND organization_id::text = $2",
            MEMBERSHIP_COLUMNS
        );
        sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(user_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load membership: {}", e))?
            .map(Membership::try_from)
            .transpose()
    }
}

#[async_trait]
impl PermissionRpc for PgDatastore {
    async fn effective_permissions(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<Vec<String>, anyhow::Error> {
        sqlx::query_scalar::<_, String>("SELECT permission FROM get_user_permissions($1, $2) AS permission")
            .bind(user_id)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("get_user_permissions failed: {}", e))
    }
}

#[async_trait]
impl ConditionStore for PgDatastore {
    async fn find_conditions(
        &self,
        organization_id: &str,
        user_id: &str,
        permission: &str,
    ) -> Result<Vec<Value>, anyhow::Error> {
        let rows: Option<Json<Vec<Value>>> = sqlx::query_scalar(
            r#"
            SELECT conditions FROM permission_conditions
            WHERE organization_id::text = $1 AND user_id::text = $2 AND permission = $3
            "#,
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(permission)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load permission conditions: {}", e))?;
        Ok(rows.map(|j| j.0).unwrap_or_default())
    }
}

#[async_trait]
impl TenantDirectory for PgDatastore {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserAccount>, anyhow::Error> {
        let row = sqlx::query(
            "SELECT id::text AS id, email, email_confirmed_at, banned_until FROM users WHERE id::text = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load user: {}", e))?;

        row.map(|r| -> Result<UserAccount, anyhow::Error> {
            Ok(UserAccount {
                id: r.try_get("id")?,
                email: r.try_get("email")?,
                email_confirmed_at: r.try_get("email_confirmed_at")?,
                banned_until: r.try_get("banned_until")?,
            })
        })
        .transpose()
    }

    async fn find_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<Organization>, anyhow::Error> {
        let row = sqlx::query(
            r#"
            SELECT id::text AS id, name, status, billing_status, deleted_at
            FROM organizations WHERE id::text = $1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load organization: {}", e))?;

        row.map(|r| -> Result<Organization, anyhow::Error> {
            let status: String = r.try_get("status")?;
            let billing: Option<String> = r.try_get("billing_status")?;
            Ok(Organization {
                id: r.try_get("id")?,
                name: r.try_get("name")?,
                status: status.parse().map_err(|e: String| anyhow::anyhow!(e))?,
                billing_status: billing.and_then(|b| b.parse().ok()),
                deleted_at: r.try_get("deleted_at")?,
            })
        })
        .transpose()
    }

    async fn find_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Workspace>, anyhow::Error> {
        let row = sqlx::query(
            "SELECT id::text AS id, organization_id::text AS organization_id, name FROM workspaces WHERE id::text = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load workspace: {}", e))?;

        row.map(|r| -> Result<Workspace, anyhow::Error> {
            Ok(Workspace {
                id: r.try_get("id")?,
                organization_id: r.try_get("organization_id")?,
                name: r.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn is_workspace_member(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<bool, anyhow::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM workspace_members WHERE workspace_id::text = $1 AND user_id::text = $2)",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to check workspace membership: {}", e))
    }

    async fn find_project(&self, project_id: &str) -> Result<Option<Project>, anyhow::Error> {
        let row = sqlx::query(
            r#"
            SELECT id::text AS id, organization_id::text AS organization_id,
                   workspace_id::text AS workspace_id, name
            FROM projects WHERE id::text = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load project: {}", e))?;

        row.map(|r| -> Result<Project, anyhow::Error> {
            Ok(Project {
                id: r.try_get("id")?,
                organization_id: r.try_get("organization_id")?,
                workspace_id: r.try_get("workspace_id")?,
                name: r.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn is_project_member(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<bool, anyhow::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM project_members WHERE project_id::text = $1 AND user_id::text = $2)",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to check project membership: {}", e))
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, anyhow::Error> {
        let row = sqlx::query(
            r#"
            SELECT id::text AS id, organization_id::text AS organization_id, name, key_hash,
                   permissions, expires_at, revoked_at, last_used_at
            FROM api_keys WHERE key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load API key: {}", e))?;

        row.map(|r| -> Result<ApiKey, anyhow::Error> {
            let permissions: Option<Json<Vec<String>>> = r.try_get("permissions")?;
            Ok(ApiKey {
                id: r.try_get("id")?,
                organization_id: r.try_get("organization_id")?,
                name: r.try_get("name")?,
                key_hash: r.try_get("key_hash")?,
                permissions: permissions.map(|j| j.0).unwrap_or_default(),
                expires_at: r.try_get("expires_at")?,
                revoked_at: r.try_get("revoked_at")?,
                last_used_at: r.try_get("last_used_at")?,
            })
        })
        .transpose()
    }

    async fn touch_api_key(&self, key_id: &str) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id::text = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to update API key usage: {}", e))?;
        Ok(())
    }

    async fn security_signals(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<SecuritySignals, anyhow::Error> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (
                    WHERE action = 'auth.login_failed' AND created_at > NOW() - INTERVAL '24 hours'
                ) AS failed_logins,
                COUNT(DISTINCT ip_address) FILTER (
                    WHERE created_at > NOW() - INTERVAL '1 hour'
                ) AS distinct_ips,
                COUNT(*) FILTER (
                    WHERE result = 'failure'
                      AND error_message LIKE 'Missing permission:%'
                      AND created_at > NOW() - INTERVAL '1 hour'
                ) AS denials
            FROM audit_logs
            WHERE actor_id::text = $1 AND organization_id::text = $2
              AND created_at > NOW() - INTERVAL '24 hours'
            "#,
        )
        .bind(user_id)
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load security signals: {}", e))?;

        let clamp = |n: i64| u32::try_from(n.max(0)).unwrap_or(u32::MAX);
        Ok(SecuritySignals {
            failed_logins_24h: clamp(row.try_get("failed_logins")?),
            distinct_ips_1h: clamp(row.try_get("distinct_ips")?),
            permission_denials_1h: clamp(row.try_get("denials")?),
        })
    }
}

#[async_trait]
impl TenantSession for PgDatastore {
    async fn begin_scope(
        &self,
        scope: &TenantScope,
    ) -> Result<Box<dyn ScopedSession>, anyhow::Error> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to acquire tenant connection: {}", e))?;
        sqlx::query(APPLY_TENANT_SQL)
            .bind(&scope.user_id)
            .bind(&scope.organization_id)
            .bind(scope.role.map(|r| r.as_str()).unwrap_or(""))
            .execute(&mut *conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to apply tenant settings: {}", e))?;
        Ok(Box::new(PgScopedSession {
            scope: scope.clone(),
            conn,
        }))
    }

    async fn isolation_enabled(&self) -> Result<bool, anyhow::Error> {
        let tables: Vec<&str> = std::iter::once(IsolatedTable::Organizations)
            .chain(IsolatedTable::CANARY_TABLES)
            .map(|t| t.table_name())
            .collect();

        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT bool_and(relrowsecurity) FROM pg_class WHERE relkind = 'r' AND relname = ANY($1)",
        )
        .bind(tables)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read row-level security status: {}", e))?;

        Ok(enabled.unwrap_or(false))
    }

    async fn find_foreign_organization(
        &self,
        organization_id: &str,
    ) -> Result<Option<String>, anyhow::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT id::text FROM organizations WHERE id::text <> $1 ORDER BY created_at LIMIT 1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to pick canary organization: {}", e))
    }
}

/// Pooled connection carrying one tenant's settings.
pub struct PgScopedSession {
    scope: TenantScope,
    conn: PoolConnection<Postgres>,
}

#[async_trait]
impl ScopedSession for PgScopedSession {
    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn find_membership(
        &mut self,
        user_id: &str,
    ) -> Result<Option<Membership>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM organization_members WHERE user_id::text = $1 AND organization_id::text = $2",
            MEMBERSHIP_COLUMNS
        );
        sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(user_id)
            .bind(&self.scope.organization_id)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load membership: {}", e))?
            .map(Membership::try_from)
            .transpose()
    }

    async fn list_memberships(&mut self) -> Result<Vec<Membership>, anyhow::Error> {
        let sql = format!(
            "SELECT {} FROM organization_members WHERE organization_id::text = $1 ORDER BY joined_at",
            MEMBERSHIP_COLUMNS
        );
        sqlx::query_as::<_, MembershipRow>(&sql)
            .bind(&self.scope.organization_id)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list memberships: {}", e))?
            .into_iter()
            .map(Membership::try_from)
            .collect()
    }

    async fn save_membership(&mut self, membership: &Membership) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            UPDATE organization_members
            SET role = $3, status = $4, permissions = $5, custom_permissions = $6, updated_at = $7
            WHERE user_id::text = $1 AND organization_id::text = $2
            "#,
        )
        .bind(&membership.user_id)
        .bind(&membership.organization_id)
        .bind(membership.role.as_str())
        .bind(membership.status.as_str())
        .bind(Json(&membership.permissions))
        .bind(Json(&membership.custom_permissions))
        .bind(membership.updated_at)
        .execute(&mut *self.conn)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to update membership: {}", e))?;
        Ok(())
    }

    async fn query_audit_logs(
        &mut self,
        filters: &AuditFilters,
    ) -> Result<AuditPage, anyhow::Error> {
        let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM audit_logs");
        push_audit_filters(&mut count, filters);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to count audit logs: {}", e))?;

        let mut select: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM audit_logs", AUDIT_COLUMNS));
        push_audit_filters(&mut select, filters);
        select
            .push(" ORDER BY created_at DESC, id LIMIT ")
            .push_bind(filters.limit)
            .push(" OFFSET ")
            .push_bind(filters.offset);

        let rows = select
            .build()
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to query audit logs: {}", e))?;
        let logs = rows
            .iter()
            .map(audit_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AuditPage {
            logs,
            total,
            limit: filters.limit,
            offset: filters.offset,
        })
    }

    async fn visible_organization_ids(&mut self) -> Result<Vec<String>, anyhow::Error> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT id::text FROM organizations ORDER BY id")
                .fetch_all(&mut *self.conn)
                .await?,
        )
    }

    async fn count_rows_for_organization(
        &mut self,
        table: IsolatedTable,
        target_organization_id: &str,
    ) -> Result<i64, anyhow::Error> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}::text = $1",
            table.table_name(),
            organization_column(table)
        );
        Ok(sqlx::query_scalar::<_, i64>(&sql)
            .bind(target_organization_id)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn count_cross_tenant_rows(
        &mut self,
        table: IsolatedTable,
    ) -> Result<i64, anyhow::Error> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}::text <> $1",
            table.table_name(),
            organization_column(table)
        );
        Ok(sqlx::query_scalar::<_, i64>(&sql)
            .bind(&self.scope.organization_id)
            .fetch_one(&mut *self.conn)
            .await?)
    }

    async fn release(self: Box<Self>) -> Result<(), anyhow::Error> {
        let mut session = *self;
        if let Err(e) = sqlx::query(CLEAR_TENANT_SQL)
            .execute(&mut *session.conn)
            .await
        {
            warn!(error = %e, "Failed to clear tenant settings, closing connection");
            session.conn.close_on_drop();
            return Err(anyhow::anyhow!("Failed to clear tenant settings: {}", e));
        }
        Ok(())
    }
}

fn push_audit_filters(builder: &mut QueryBuilder<'_, Postgres>, filters: &AuditFilters) {
    builder.push(" WHERE TRUE");
    if let Some(org) = &filters.organization_id {
        builder.push(" AND organization_id::text = ").push_bind(org.clone());
    }
    if let Some(actor) = &filters.actor_id {
        builder.push(" AND actor_id::text = ").push_bind(actor.clone());
    }
    match &filters.action {
        Some(ActionFilter::One(action)) => {
            builder.push(" AND action = ").push_bind(action.clone());
        }
        Some(ActionFilter::Many(actions)) => {
            builder.push(" AND action = ANY(").push_bind(actions.clone()).push(")");
        }
        None => {}
    }
    if let Some(resource_type) = &filters.resource_type {
        builder
            .push(" AND resource_type = ")
            .push_bind(resource_type.clone());
    }
    if let Some(from) = filters.from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filters.to {
        builder.push(" AND created_at <= ").push_bind(to);
    }
}

#[async_trait]
impl AuditSink for PgDatastore {
    async fn insert_batch(&self, logs: &[AuditLog]) -> Result<(), anyhow::Error> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO audit_logs (id, organization_id, actor_id, actor_type, action, \
             resource_type, resource_id, resource_name, changes, metadata, result, \
             error_message, ip_address, user_agent, created_at) ",
        );
        builder.push_values(logs, |mut row, log| {
            row.push_bind(log.id)
                .push_bind(log.organization_id.clone())
                .push_bind(log.actor_id.clone())
                .push_bind(log.actor_type.as_str())
                .push_bind(log.action.clone())
                .push_bind(log.resource_type.clone())
                .push_bind(log.resource_id.clone())
                .push_bind(log.resource_name.clone())
                .push_bind(log.changes.clone())
                .push_bind(log.metadata.clone())
                .push_bind(log.result.as_str())
                .push_bind(log.error_message.clone())
                .push_bind(log.ip_address.clone())
                .push_bind(log.user_agent.clone())
                .push_bind(log.created_at);
        });

        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to insert audit batch: {}", e))?;
        Ok(())
    }
}

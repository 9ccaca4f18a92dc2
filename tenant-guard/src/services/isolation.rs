//! Row-level isolation enforcement and its self-verification.
//!
//! The canary set checks that a session scoped to one organization sees its
//! own organization row, nothing of a foreign organization, and zero
//! cross-tenant rows in the tenant tables. Any mismatch is a security
//! incident and aborts the request.
//!
//! Enforcement hands back the [`TenantConnection`] it verified. Requests
//! keep using that connection until the pipeline releases it.

use crate::config::IsolationConfig;
use crate::models::{AuditActor, AuditEvent, IsolatedTable, TenantContext, TenantScope};
use crate::services::audit_logger::AuditLogger;
use crate::services::error::TenancyError;
use crate::services::store::TenantSession;
use crate::services::tenant_connection::TenantConnection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct IsolationReport {
    pub isolated: bool,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Proof that tenant settings were applied, plus the connection carrying them.
#[derive(Debug, Clone)]
pub struct EnforcementReceipt {
    pub organization_id: String,
    pub duration: Duration,
    pub connection: TenantConnection,
}

#[derive(Clone)]
pub struct IsolationEnforcer {
    session: Arc<dyn TenantSession>,
    audit: AuditLogger,
    config: IsolationConfig,
}

impl IsolationEnforcer {
    pub fn new(session: Arc<dyn TenantSession>, audit: AuditLogger, config: IsolationConfig) -> Self {
        Self {
            session,
            audit,
            config,
        }
    }

    /// Set the session tenant before any tenant-scoped query runs.
    pub async fn enforce_context(
        &self,
        context: &TenantContext,
    ) -> Result<EnforcementReceipt, TenancyError> {
        let started = Instant::now();

        if self.config.detect_bypass {
            self.detect_bypass(Some(context)).await?;
        }

        let scope = context.scope();
        let connection = match TenantConnection::open(self.session.as_ref(), scope.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                let issues = vec![format!("Failed to set tenant context: {}", e)];
                self.report_breach(&scope, &issues);
                return Err(TenancyError::IsolationFailure { issues });
            }
        };

        if self.config.verify_each_request {
            let report = self.run_canaries(&connection).await;
            if !report.isolated {
                self.report_breach(&scope, &report.issues);
                self.close(&connection).await;
                return Err(TenancyError::IsolationFailure {
                    issues: report.issues,
                });
            }
        }

        let duration = started.elapsed();
        tracing::debug!(
            organization_id = %context.organization_id,
            duration_ms = duration.as_millis() as u64,
            "Tenant isolation context set"
        );
        Ok(EnforcementReceipt {
            organization_id: context.organization_id.clone(),
            duration,
            connection,
        })
    }

    /// Canary check as a boolean. A failing check is reported as an incident.
    pub async fn validate_policies(&self, user_id: &str, organization_id: &str) -> bool {
        let scope = TenantScope::new(user_id, organization_id);
        let report = self.check_scope(&scope).await;
        if !report.isolated {
            self.report_breach(&scope, &report.issues);
        }
        report.isolated
    }

    /// Canary check with itemized findings.
    pub async fn test_data_isolation(&self, context: &TenantContext) -> IsolationReport {
        let scope = context.scope();
        let report = self.check_scope(&scope).await;
        if !report.isolated {
            self.report_breach(&scope, &report.issues);
        }
        report
    }

    /// Canaries on a connection of its own, released afterwards.
    async fn check_scope(&self, scope: &TenantScope) -> IsolationReport {
        let connection = match TenantConnection::open(self.session.as_ref(), scope.clone()).await {
            Ok(connection) => connection,
            Err(e) => return report(vec![format!("Failed to set tenant context: {}", e)]),
        };
        let report = self.run_canaries(&connection).await;
        self.close(&connection).await;
        report
    }

    async fn close(&self, connection: &TenantConnection) {
        if let Err(e) = connection.release().await {
            tracing::warn!(
                organization_id = %connection.organization_id(),
                error = %e,
                "Failed to release tenant connection"
            );
        }
    }

    /// Circuit breaker: refuse to proceed when isolation is switched off.
    pub async fn detect_bypass(&self, context: Option<&TenantContext>) -> Result<(), TenancyError> {
        let enabled = match self.session.isolation_enabled().await {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::error!(error = %e, "Could not determine isolation status");
                false
            }
        };
        if enabled {
            return Ok(());
        }

        tracing::error!(
            security_incident = true,
            organization_id = context.map(|c| c.organization_id.as_str()).unwrap_or(""),
            "Row-level tenant isolation is disabled"
        );
        let actor = match context {
            Some(c) => AuditActor::user(&c.organization_id, &c.user_id),
            None => AuditActor::system(None),
        };
        self.audit.log_failure(
            &actor,
            AuditEvent::new("security.breach_detected", "tenant_isolation")
                .with_metadata(serde_json::json!({ "reason": "isolation_disabled" })),
            "Tenant isolation disabled",
        );
        Err(TenancyError::IsolationDisabled)
    }

    async fn run_canaries(&self, connection: &TenantConnection) -> IsolationReport {
        let mut issues = Vec::new();
        let org = connection.organization_id();

        match connection.visible_organization_ids().await {
            Ok(ids) if ids.len() == 1 && ids[0] == org => {}
            Ok(ids) => issues.push(format!(
                "Expected to see only organization {}, saw {} organization(s)",
                org,
                ids.len()
            )),
            Err(e) => issues.push(format!("Organization canary failed: {}", e)),
        }

        match self.session.find_foreign_organization(org).await {
            Ok(Some(foreign)) => {
                for table in std::iter::once(IsolatedTable::Organizations)
                    .chain(IsolatedTable::CANARY_TABLES)
                {
                    match connection
                        .count_rows_for_organization(table, &foreign)
                        .await
                    {
                        Ok(0) => {}
                        Ok(n) => issues.push(format!(
                            "{} row(s) of a foreign organization visible in {}",
                            n, table
                        )),
                        Err(e) => issues.push(format!("Foreign canary on {} failed: {}", table, e)),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => issues.push(format!("Foreign organization lookup failed: {}", e)),
        }

        for table in IsolatedTable::CANARY_TABLES {
            match connection.count_cross_tenant_rows(table).await {
                Ok(0) => {}
                Ok(n) => issues.push(format!("{} cross-tenant row(s) visible in {}", n, table)),
                Err(e) => issues.push(format!("Cross-tenant canary on {} failed: {}", table, e)),
            }
        }

        report(issues)
    }

    fn report_breach(&self, scope: &TenantScope, issues: &[String]) {
        tracing::error!(
            security_incident = true,
            user_id = %scope.user_id,
            organization_id = %scope.organization_id,
            issues = ?issues,
            "Tenant isolation breach detected"
        );
        self.audit.log_failure(
            &AuditActor::user(&scope.organization_id, &scope.user_id),
            AuditEvent::new("security.breach_detected", "tenant_isolation")
                .with_resource_id(&scope.organization_id)
                .with_metadata(serde_json::json!({ "issues": issues })),
            "Tenant isolation check failed",
        );
    }
}

fn report(issues: Vec<String>) -> IsolationReport {
    IsolationReport {
        isolated: issues.is_empty(),
        issues,
        checked_at: Utc::now(),
    }
}

//! Audit log query and export for the caller's organization.

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::{ActionFilter, AuditFilters, AuditPage, ExportFormat, TenantContext};
use crate::services::TenantConnection;
use crate::TenantGuard;
use service_core::error::AppError;

/// Query params shared by listing and export. The organization always comes
/// from the tenant context, never from the query.
#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    pub actor_id: Option<String>,
    /// One action or a comma-separated list.
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    pub format: Option<ExportFormat>,
}

fn default_limit() -> i64 {
    100
}

impl AuditLogQuery {
    fn into_filters(self, organization_id: &str) -> AuditFilters {
        let action = self
            .action
            .map(|raw| {
                let actions: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect();
                match <[String; 1]>::try_from(actions) {
                    Ok([single]) => ActionFilter::One(single),
                    Err(many) => ActionFilter::Many(many),
                }
            })
            .filter(|filter| !filter.as_slice().is_empty());

        AuditFilters {
            organization_id: Some(organization_id.to_string()),
            actor_id: self.actor_id,
            action,
            resource_type: self.resource_type,
            from: self.from,
            to: self.to,
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// GET /organizations/:org_id/audit-logs
#[tracing::instrument(
    skip(guard, context, connection, query),
    fields(organization_id = %context.organization_id, limit = query.limit, offset = query.offset)
)]
pub async fn list_audit_logs(
    State(guard): State<Arc<TenantGuard>>,
    context: TenantContext,
    connection: TenantConnection,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditPage>, AppError> {
    let filters = query.into_filters(&context.organization_id);
    let page = guard.audit().query(&connection, filters).await?;
    Ok(Json(page))
}

/// GET /organizations/:org_id/audit-logs/export?format=csv
#[tracing::instrument(skip(guard, context, connection, query), fields(organization_id = %context.organization_id))]
pub async fn export_audit_logs(
    State(guard): State<Arc<TenantGuard>>,
    context: TenantContext,
    connection: TenantConnection,
    Query(query): Query<AuditLogQuery>,
) -> Result<Response, AppError> {
    let format = query.format.unwrap_or(ExportFormat::Json);
    let filters = query.into_filters(&context.organization_id);
    let body = guard.audit().export(&connection, format, filters).await?;

    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv; charset=utf-8",
    };
    let disposition = format!(
        "attachment; filename=\"audit-logs-{}.{}\"",
        context.organization_id, format
    );

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

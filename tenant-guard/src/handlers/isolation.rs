use axum::{extract::State, Json};
use std::sync::Arc;

use crate::models::TenantContext;
use crate::services::IsolationReport;
use crate::TenantGuard;

/// Run the isolation canaries for the caller's organization.
///
/// GET /organizations/:org_id/isolation
#[tracing::instrument(skip(guard, context), fields(organization_id = %context.organization_id))]
pub async fn isolation_report(
    State(guard): State<Arc<TenantGuard>>,
    context: TenantContext,
) -> Json<IsolationReport> {
    Json(guard.isolation().test_data_isolation(&context).await)
}

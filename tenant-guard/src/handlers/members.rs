//! Organization membership administration.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::{MemberRole, Membership, MembershipStatus, TenantContext};
use crate::services::{TenancyError, TenantConnection};
use crate::TenantGuard;
use service_core::error::AppError;

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: Option<MemberRole>,
    pub custom_permissions: Option<Vec<String>>,
    /// `active` or `suspended`. Removal goes through DELETE.
    pub status: Option<MembershipStatus>,
}

/// GET /organizations/:org_id/members
pub async fn list_members(
    State(guard): State<Arc<TenantGuard>>,
    context: TenantContext,
    connection: TenantConnection,
) -> Result<Json<Vec<Membership>>, AppError> {
    let members = guard.memberships().list(&context, &connection).await?;
    Ok(Json(members))
}

/// PATCH /organizations/:org_id/members/:user_id
#[tracing::instrument(skip(guard, context, connection, request), fields(organization_id = %context.organization_id))]
pub async fn update_member(
    State(guard): State<Arc<TenantGuard>>,
    context: TenantContext,
    connection: TenantConnection,
    Path((_org_id, user_id)): Path<(String, String)>,
    Json(request): Json<UpdateMemberRequest>,
) -> Result<Json<Membership>, AppError> {
    let manager = guard.memberships();
    let mut updated = None;

    if let Some(role) = request.role {
        updated = Some(manager.change_role(&context, &connection, &user_id, role).await?);
    }
    if let Some(permissions) = request.custom_permissions {
        updated = Some(
            manager
                .set_custom_permissions(&context, &connection, &user_id, permissions)
                .await?,
        );
    }
    match request.status {
        Some(MembershipStatus::Active) => {
            updated = Some(manager.reactivate(&context, &connection, &user_id).await?);
        }
        Some(MembershipStatus::Suspended) => {
            updated = Some(manager.suspend(&context, &connection, &user_id).await?);
        }
        Some(other) => {
            return Err(TenancyError::InvalidInput(format!(
                "Status {} cannot be set directly",
                other
            ))
            .into());
        }
        None => {}
    }

    updated
        .map(Json)
        .ok_or_else(|| TenancyError::InvalidInput("Nothing to update".to_string()).into())
}

/// DELETE /organizations/:org_id/members/:user_id
#[tracing::instrument(skip(guard, context, connection), fields(organization_id = %context.organization_id))]
pub async fn remove_member(
    State(guard): State<Arc<TenantGuard>>,
    context: TenantContext,
    connection: TenantConnection,
    Path((_org_id, user_id)): Path<(String, String)>,
) -> Result<Json<Membership>, AppError> {
    let membership = guard.memberships().remove(&context, &connection, &user_id).await?;
    Ok(Json(membership))
}

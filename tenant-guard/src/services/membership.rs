//! Admin-side membership mutations. Each write goes through the request's
//! tenant connection, busts the permission cache for the member and leaves
//! an audit record.

use crate::models::{
    AuditActor, AuditEvent, MemberRole, Membership, MembershipStatus, TenantContext,
};
use crate::services::audit_logger::AuditLogger;
use crate::services::error::TenancyError;
use crate::services::permission::PermissionEngine;
use crate::services::tenant_connection::TenantConnection;
use chrono::Utc;
use serde_json::json;

#[derive(Clone)]
pub struct MembershipManager {
    permissions: PermissionEngine,
    audit: AuditLogger,
}

impl MembershipManager {
    pub fn new(permissions: PermissionEngine, audit: AuditLogger) -> Self {
        Self { permissions, audit }
    }

    pub async fn list(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
    ) -> Result<Vec<Membership>, TenancyError> {
        same_tenant(actor, connection)?;
        connection.list_memberships().await
    }

    pub async fn change_role(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
        role: MemberRole,
    ) -> Result<Membership, TenancyError> {
        if role == MemberRole::Owner && actor.role != MemberRole::Owner {
            return Err(TenancyError::AccessDenied(
                "Only owners can grant the owner role".to_string(),
            ));
        }
        let mut membership = self.load_managed(actor, connection, user_id).await?;
        let previous = membership.role;
        membership.role = role;

        self.commit(
            actor,
            connection,
            membership,
            AuditEvent::new("member.role_changed", "member")
                .with_changes(json!({ "role": { "from": previous, "to": role } })),
        )
        .await
    }

    pub async fn set_custom_permissions(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
        permissions: Vec<String>,
    ) -> Result<Membership, TenancyError> {
        if let Some(bad) = permissions.iter().find(|p| !is_valid_permission_token(p)) {
            return Err(TenancyError::InvalidInput(format!(
                "Invalid permission token: {}",
                bad
            )));
        }
        let mut membership = self.load_managed(actor, connection, user_id).await?;
        let previous = std::mem::replace(&mut membership.custom_permissions, permissions);

        let changes = json!({
            "custom_permissions": {
                "from": previous,
                "to": membership.custom_permissions,
            }
        });
        self.commit(
            actor,
            connection,
            membership,
            AuditEvent::new("member.permissions_changed", "member").with_changes(changes),
        )
        .await
    }

    pub async fn suspend(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
    ) -> Result<Membership, TenancyError> {
        self.transition(actor, connection, user_id, MembershipStatus::Suspended, "member.suspended")
            .await
    }

    pub async fn reactivate(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
    ) -> Result<Membership, TenancyError> {
        self.transition(actor, connection, user_id, MembershipStatus::Active, "member.reactivated")
            .await
    }

    /// Soft delete. The row stays for audit history.
    pub async fn remove(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
    ) -> Result<Membership, TenancyError> {
        self.transition(actor, connection, user_id, MembershipStatus::Removed, "member.removed")
            .await
    }

    async fn transition(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
        status: MembershipStatus,
        action: &str,
    ) -> Result<Membership, TenancyError> {
        if user_id == actor.user_id && status != MembershipStatus::Active {
            return Err(TenancyError::InvalidInput(
                "Members cannot change their own status".to_string(),
            ));
        }
        let mut membership = self.load_managed(actor, connection, user_id).await?;
        if membership.status == MembershipStatus::Removed {
            return Err(TenancyError::InvalidInput(
                "Membership has been removed".to_string(),
            ));
        }
        let previous = membership.status;
        membership.status = status;

        self.commit(
            actor,
            connection,
            membership,
            AuditEvent::new(action, "member")
                .with_changes(json!({ "status": { "from": previous, "to": status } })),
        )
        .await
    }

    /// Fetch a membership the actor is allowed to manage.
    async fn load_managed(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        user_id: &str,
    ) -> Result<Membership, TenancyError> {
        if !actor.is_admin() {
            return Err(TenancyError::forbidden("member:manage"));
        }
        same_tenant(actor, connection)?;
        let membership = connection
            .find_membership(user_id)
            .await?
            .ok_or_else(|| TenancyError::InvalidInput("Member not found".to_string()))?;

        if membership.role == MemberRole::Owner && actor.role != MemberRole::Owner {
            return Err(TenancyError::AccessDenied(
                "Only owners can manage other owners".to_string(),
            ));
        }
        Ok(membership)
    }

    async fn commit(
        &self,
        actor: &TenantContext,
        connection: &TenantConnection,
        mut membership: Membership,
        event: AuditEvent,
    ) -> Result<Membership, TenancyError> {
        membership.updated_at = Utc::now();
        let audit_actor = AuditActor::user(&actor.organization_id, &actor.user_id);
        let event = event.with_resource_id(&membership.user_id);

        if let Err(e) = connection.save_membership(&membership).await {
            self.audit
                .log_failure(&audit_actor, event, format!("Membership write failed: {}", e));
            return Err(e);
        }

        self.permissions
            .invalidate(&membership.user_id, &membership.organization_id);
        self.audit.log(&audit_actor, event);

        tracing::info!(
            actor_id = %actor.user_id,
            user_id = %membership.user_id,
            organization_id = %membership.organization_id,
            role = %membership.role,
            status = %membership.status,
            "Membership updated"
        );
        Ok(membership)
    }
}

fn same_tenant(actor: &TenantContext, connection: &TenantConnection) -> Result<(), TenancyError> {
    if connection.organization_id() != actor.organization_id {
        return Err(TenancyError::AccessDenied(
            "Connection is scoped to another organization".to_string(),
        ));
    }
    Ok(())
}

fn is_valid_permission_token(token: &str) -> bool {
    if token == "*" {
        return true;
    }
    matches!(
        token.split_once(':'),
        Some((resource, action)) if !resource.is_empty() && !action.is_empty() && !action.contains(':')
    )
}

//! Deep validation of a resolved tenant context and of resource-scoped access.

use crate::config::ValidationPolicy;
use crate::models::{
    ApiKey, IssueCode, PermissionSet, Project, TenantContext, ValidationIssue, ValidationResult,
    Workspace,
};
use crate::services::error::TenancyError;
use crate::services::permission::PermissionEngine;
use crate::services::store::{MembershipStore, TenantDirectory};
use chrono::Utc;
use service_core::utils::hashing::{constant_time_eq, sha256_hex};
use std::sync::Arc;

#[derive(Clone)]
pub struct ContextValidator {
    directory: Arc<dyn TenantDirectory>,
    memberships: Arc<dyn MembershipStore>,
    permissions: PermissionEngine,
    policy: ValidationPolicy,
}

impl ContextValidator {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        memberships: Arc<dyn MembershipStore>,
        permissions: PermissionEngine,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            directory,
            memberships,
            permissions,
            policy,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Ordered standing checks. Stops at the first hard error; warnings
    /// collected up to that point are kept.
    pub async fn validate_tenant_context(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<ValidationResult, TenancyError> {
        let mut warnings = Vec::new();

        let Some(user) = self.directory.find_user(user_id).await? else {
            return Ok(self.fail(
                user_id,
                organization_id,
                ValidationIssue::new(IssueCode::UserNotFound, "User not found"),
                warnings,
            ));
        };
        if user.is_banned_at(Utc::now()) {
            return Ok(self.fail(
                user_id,
                organization_id,
                ValidationIssue::new(IssueCode::UserBanned, "User is banned"),
                warnings,
            ));
        }
        if !user.is_confirmed() {
            warnings.push(ValidationIssue::new(
                IssueCode::EmailUnconfirmed,
                "Email address not confirmed",
            ));
        }

        let Some(organization) = self.directory.find_organization(organization_id).await? else {
            return Ok(self.fail(
                user_id,
                organization_id,
                ValidationIssue::new(IssueCode::OrganizationNotFound, "Organization not found"),
                warnings,
            ));
        };
        if organization.is_deleted() {
            return Ok(self.fail(
                user_id,
                organization_id,
                ValidationIssue::new(IssueCode::OrganizationDeleted, "Organization has been deleted"),
                warnings,
            ));
        }
        if organization.status != crate::models::OrganizationStatus::Active {
            return Ok(self.fail(
                user_id,
                organization_id,
                ValidationIssue::new(
                    IssueCode::OrganizationInactive,
                    format!("Organization is {}", organization.status),
                ),
                warnings,
            ));
        }

        let membership = match self
            .memberships
            .find_membership(user_id, organization_id)
            .await?
        {
            Some(m) if m.is_active() => m,
            Some(m) => {
                return Ok(self.fail(
                    user_id,
                    organization_id,
                    ValidationIssue::new(
                        IssueCode::MembershipInactive,
                        format!("Membership is {}", m.status),
                    ),
                    warnings,
                ));
            }
            None => {
                return Ok(self.fail(
                    user_id,
                    organization_id,
                    ValidationIssue::new(IssueCode::MembershipNotFound, "Not a member of organization"),
                    warnings,
                ));
            }
        };

        let permissions = match self
            .permissions
            .get_user_permissions(user_id, organization_id)
            .await
        {
            Ok(set) => set,
            Err(_) => {
                warnings.push(ValidationIssue::new(
                    IssueCode::PermissionsUnavailable,
                    "Permissions could not be loaded",
                ));
                Arc::new(PermissionSet::default())
            }
        };

        let mut errors = Vec::new();

        if organization.is_past_due() {
            let issue = ValidationIssue::new(IssueCode::BillingPastDue, "Billing is past due");
            if self.policy.promote_past_due_billing {
                errors.push(issue);
            } else {
                warnings.push(issue);
            }
        }

        match self.directory.security_signals(user_id, organization_id).await {
            Ok(signals) => {
                let mut flagged = Vec::new();
                if signals.failed_logins_24h > self.policy.max_failed_logins_24h {
                    flagged.push(ValidationIssue::new(
                        IssueCode::ExcessiveFailedLogins,
                        format!(
                            "{} failed logins in the last 24 hours",
                            signals.failed_logins_24h
                        ),
                    ));
                }
                if signals.distinct_ips_1h > self.policy.max_distinct_ips_1h {
                    flagged.push(ValidationIssue::new(
                        IssueCode::MultipleIpAddresses,
                        format!(
                            "{} distinct IP addresses in the last hour",
                            signals.distinct_ips_1h
                        ),
                    ));
                }
                if signals.permission_denials_1h > self.policy.max_permission_denials_1h {
                    flagged.push(ValidationIssue::new(
                        IssueCode::ExcessivePermissionDenials,
                        format!(
                            "{} permission denials in the last hour",
                            signals.permission_denials_1h
                        ),
                    ));
                }
                if self.policy.promote_security_signals {
                    errors.extend(flagged);
                } else {
                    warnings.extend(flagged);
                }
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Security signal lookup failed");
                warnings.push(ValidationIssue::new(
                    IssueCode::SecurityCheckUnavailable,
                    "Security checks unavailable",
                ));
            }
        }

        if !warnings.is_empty() {
            tracing::warn!(
                user_id = %user_id,
                organization_id = %organization_id,
                warnings = ?warnings.iter().map(|w| w.message.as_str()).collect::<Vec<_>>(),
                "Tenant context validated with warnings"
            );
        }

        if !errors.is_empty() {
            tracing::warn!(
                user_id = %user_id,
                organization_id = %organization_id,
                errors = ?errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(),
                "Tenant context rejected by policy"
            );
            return Ok(ValidationResult {
                is_valid: false,
                errors,
                warnings,
                context: None,
            });
        }

        Ok(ValidationResult {
            is_valid: true,
            errors,
            warnings,
            context: Some(TenantContext::new(
                organization_id,
                user_id,
                membership.role,
                permissions,
            )),
        })
    }

    fn fail(
        &self,
        user_id: &str,
        organization_id: &str,
        error: ValidationIssue,
        warnings: Vec<ValidationIssue>,
    ) -> ValidationResult {
        tracing::info!(
            user_id = %user_id,
            organization_id = %organization_id,
            code = ?error.code,
            reason = %error.message,
            "Tenant context validation failed"
        );
        ValidationResult::failed(error, warnings)
    }

    pub async fn validate_workspace_access(
        &self,
        context: &TenantContext,
        workspace_id: &str,
    ) -> Result<Workspace, TenancyError> {
        let workspace = self
            .directory
            .find_workspace(workspace_id)
            .await?
            .ok_or_else(|| TenancyError::AccessDenied("Workspace not found".to_string()))?;

        if workspace.organization_id != context.organization_id {
            tracing::error!(
                security_incident = true,
                user_id = %context.user_id,
                organization_id = %context.organization_id,
                workspace_id = %workspace_id,
                "Cross-tenant workspace access attempt"
            );
            return Err(TenancyError::AccessDenied("Workspace not found".to_string()));
        }

        if !context.is_admin()
            && !self
                .directory
                .is_workspace_member(workspace_id, &context.user_id)
                .await?
        {
            return Err(TenancyError::AccessDenied(
                "Not a member of this workspace".to_string(),
            ));
        }

        Ok(workspace)
    }

    pub async fn validate_project_access(
        &self,
        context: &TenantContext,
        project_id: &str,
        workspace_id: Option<&str>,
    ) -> Result<Project, TenancyError> {
        let project = self
            .directory
            .find_project(project_id)
            .await?
            .ok_or_else(|| TenancyError::AccessDenied("Project not found".to_string()))?;

        if project.organization_id != context.organization_id {
            tracing::error!(
                security_incident = true,
                user_id = %context.user_id,
                organization_id = %context.organization_id,
                project_id = %project_id,
                "Cross-tenant project access attempt"
            );
            return Err(TenancyError::AccessDenied("Project not found".to_string()));
        }

        if workspace_id.is_some_and(|ws| ws != project.workspace_id) {
            return Err(TenancyError::AccessDenied(
                "Project does not belong to workspace".to_string(),
            ));
        }

        if !context.is_admin()
            && !self
                .directory
                .is_project_member(project_id, &context.user_id)
                .await?
        {
            return Err(TenancyError::AccessDenied(
                "Not a member of this project".to_string(),
            ));
        }

        Ok(project)
    }

    /// Authenticate a raw API key for `organization_id`. Unknown, revoked,
    /// expired and foreign keys are indistinguishable to the caller.
    pub async fn validate_api_key_access(
        &self,
        key: &str,
        organization_id: &str,
        required_permissions: &[&str],
    ) -> Result<ApiKey, TenancyError> {
        let key_hash = sha256_hex(key);
        let api_key = self
            .directory
            .find_api_key_by_hash(&key_hash)
            .await?
            .filter(|stored| constant_time_eq(&stored.key_hash, &key_hash))
            .ok_or(TenancyError::Unauthorized)?;

        let now = Utc::now();
        if api_key.is_revoked() || api_key.is_expired_at(now) {
            tracing::info!(key_id = %api_key.id, "Rejected revoked or expired API key");
            return Err(TenancyError::Unauthorized);
        }

        if api_key.organization_id != organization_id {
            tracing::warn!(
                key_id = %api_key.id,
                organization_id = %organization_id,
                "API key used against foreign organization"
            );
            return Err(TenancyError::Unauthorized);
        }

        let granted = PermissionSet::new(api_key.permissions.iter().cloned());
        if let Some(missing) = required_permissions
            .iter()
            .find(|p| !granted.grants_token(p))
        {
            return Err(TenancyError::forbidden(*missing));
        }

        if let Err(e) = self.directory.touch_api_key(&api_key.id).await {
            tracing::warn!(key_id = %api_key.id, error = %e, "Failed to record API key usage");
        }

        Ok(api_key)
    }
}

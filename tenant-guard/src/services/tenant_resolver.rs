//! Establishes the tenant context of an inbound request.
//!
//! Every failure collapses into [`TenancyError::Unauthorized`] so responses
//! never reveal whether the credential, the organization or the membership
//! was the problem.

use crate::models::TenantContext;
use crate::services::error::TenancyError;
use crate::services::permission::PermissionEngine;
use crate::services::store::{CredentialVerifier, MembershipStore, VerifiedIdentity};
use axum::http::{header, request::Parts, HeaderMap, Uri};
use std::collections::HashMap;
use std::sync::Arc;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// What resolution established before it finished or failed. The audit
/// record of a rejected request names whoever got this far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionTrail {
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
}

#[derive(Clone)]
pub struct TenantContextResolver {
    credentials: Arc<dyn CredentialVerifier>,
    memberships: Arc<dyn MembershipStore>,
    permissions: PermissionEngine,
}

impl TenantContextResolver {
    pub fn new(
        credentials: Arc<dyn CredentialVerifier>,
        memberships: Arc<dyn MembershipStore>,
        permissions: PermissionEngine,
    ) -> Self {
        Self {
            credentials,
            memberships,
            permissions,
        }
    }

    pub async fn resolve(
        &self,
        parts: &Parts,
        trail: &mut ResolutionTrail,
    ) -> Result<TenantContext, TenancyError> {
        let identity = self.authenticate(&parts.headers).await?;
        trail.user_id = Some(identity.user_id.clone());

        let organization_id = organization_id(parts).ok_or_else(|| {
            tracing::debug!(user_id = %identity.user_id, "No organization id on request");
            TenancyError::Unauthorized
        })?;
        trail.organization_id = Some(organization_id.clone());

        self.resolve_membership_context(&identity.user_id, &organization_id)
            .await
    }

    /// Verify the bearer credential.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<VerifiedIdentity, TenancyError> {
        let token = bearer_token(headers).ok_or_else(|| {
            tracing::debug!("Missing bearer credential");
            TenancyError::Unauthorized
        })?;

        match self.credentials.verify(token).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                tracing::debug!("Bearer credential rejected");
                Err(TenancyError::Unauthorized)
            }
            Err(e) => {
                tracing::error!(error = %e, "Credential verification failed");
                Err(TenancyError::Unauthorized)
            }
        }
    }

    /// Look up the active membership and fetch its permission set.
    pub async fn resolve_membership_context(
        &self,
        user_id: &str,
        organization_id: &str,
    ) -> Result<TenantContext, TenancyError> {
        let membership = match self.memberships.find_membership(user_id, organization_id).await {
            Ok(Some(m)) if m.is_active() => m,
            Ok(Some(m)) => {
                tracing::info!(
                    user_id = %user_id,
                    organization_id = %organization_id,
                    status = %m.status,
                    "Membership is not active"
                );
                return Err(TenancyError::Unauthorized);
            }
            Ok(None) => {
                tracing::info!(
                    user_id = %user_id,
                    organization_id = %organization_id,
                    "No membership for organization"
                );
                return Err(TenancyError::Unauthorized);
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    organization_id = %organization_id,
                    error = %e,
                    "Membership lookup failed"
                );
                return Err(TenancyError::Unauthorized);
            }
        };

        let permissions = self
            .permissions
            .get_user_permissions(user_id, organization_id)
            .await
            .map_err(|_| TenancyError::Unauthorized)?;

        Ok(TenantContext::new(
            organization_id,
            user_id,
            membership.role,
            permissions,
        ))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Organization id by precedence: path segment after `organization(s)`,
/// then `organizationId`/`orgId` query parameter, then the header.
pub fn organization_id(parts: &Parts) -> Option<String> {
    organization_from_path(&parts.uri)
        .or_else(|| organization_from_query(&parts.uri))
        .or_else(|| organization_from_header(&parts.headers))
}

fn organization_from_path(uri: &Uri) -> Option<String> {
    let mut segments = uri.path().split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "organization" || segment == "organizations" {
            return segments.next().map(str::to_string);
        }
    }
    None
}

fn organization_from_query(uri: &Uri) -> Option<String> {
    let params: HashMap<String, String> = serde_urlencoded::from_str(uri.query()?).ok()?;
    ["organizationId", "orgId"]
        .iter()
        .filter_map(|key| params.get(*key))
        .find(|value| !value.is_empty())
        .cloned()
}

fn organization_from_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ORGANIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

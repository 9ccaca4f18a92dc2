use crate::models::tenant_context::TenantContext;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    UserNotFound,
    UserBanned,
    EmailUnconfirmed,
    OrganizationNotFound,
    OrganizationDeleted,
    OrganizationInactive,
    MembershipNotFound,
    MembershipInactive,
    PermissionsUnavailable,
    BillingPastDue,
    ExcessiveFailedLogins,
    MultipleIpAddresses,
    ExcessivePermissionDenials,
    SecurityCheckUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of a deep context validation. Errors block, warnings do not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<TenantContext>,
}

impl ValidationResult {
    pub fn failed(error: ValidationIssue, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error],
            warnings,
            context: None,
        }
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.message.clone()).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.message.clone()).collect()
    }
}

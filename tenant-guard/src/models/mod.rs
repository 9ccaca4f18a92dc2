pub mod audit;
pub mod membership;
pub mod organization;
pub mod permission;
pub mod tenant_context;
pub mod validation;

pub use audit::{
    ActionFilter, ActorType, AuditActor, AuditEvent, AuditFilters, AuditLog, AuditPage,
    AuditResult, ExportFormat,
};
pub use membership::{MemberRole, Membership, MembershipStatus};
pub use organization::{
    ApiKey, BillingStatus, IsolatedTable, Organization, OrganizationStatus, Project,
    SecuritySignals, UserAccount, Workspace,
};
pub use permission::{
    ConditionLogic, ConditionOperator, MatchKind, PermissionCheck, PermissionCondition,
    PermissionDecision, PermissionSet,
};
pub use tenant_context::{TenantContext, TenantScope};
pub use validation::{IssueCode, ValidationIssue, ValidationResult};

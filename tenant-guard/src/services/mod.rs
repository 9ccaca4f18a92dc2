pub mod audit_logger;
pub mod context_validator;
pub mod database;
pub mod error;
pub mod isolation;
pub mod jwt;
pub mod memory;
pub mod membership;
pub mod permission;
pub mod store;
pub mod tenant_connection;
pub mod tenant_resolver;

pub use audit_logger::{AuditLogger, AuditStats};
pub use context_validator::ContextValidator;
pub use database::PgDatastore;
pub use error::TenancyError;
pub use isolation::{EnforcementReceipt, IsolationEnforcer, IsolationReport};
pub use jwt::{AccessTokenClaims, JwtVerifier};
pub use memory::MockDatastore;
pub use membership::MembershipManager;
pub use permission::{CacheStats, PermissionEngine};
pub use store::{
    AuditSink, ConditionStore, CredentialVerifier, MembershipStore, PermissionRpc, ScopedSession,
    TenantDirectory, TenantSession, VerifiedIdentity,
};
pub use tenant_connection::TenantConnection;
pub use tenant_resolver::TenantContextResolver;

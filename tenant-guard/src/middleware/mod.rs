pub mod pipeline;
pub mod tenant;

pub use pipeline::{
    AuditOutcome, CheckPermission, Diagnostics, EnforceIsolation, Exchange, Interceptor,
    Outcome, PermissionRequirement, Pipeline, PipelineError, PipelineOutcome, RateLimit,
    RequestStage, ResolveContext, RouteGuard, ValidateContext,
};
pub use tenant::{tenant_guard_middleware, GuardState, PermissionContext};

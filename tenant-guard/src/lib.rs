//! tenant-guard: multi-tenant authorization and audit core.
//!
//! [`TenantGuard`] wires the permission engine, context resolver and
//! validator, isolation enforcer, audit logger and the request pipeline
//! against a set of datastore [`Collaborators`].

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use crate::config::TenancyConfig;
use crate::middleware::pipeline::{
    AuditOutcome, CheckPermission, EnforceIsolation, Interceptor, Pipeline, RateLimit,
    ResolveContext, RouteGuard, ValidateContext,
};
use crate::middleware::tenant::{tenant_guard_middleware, GuardState};
use crate::services::{
    AuditLogger, AuditSink, ConditionStore, ContextValidator, CredentialVerifier,
    IsolationEnforcer, MembershipManager, MembershipStore, MockDatastore, PermissionEngine,
    PermissionRpc, TenancyError, TenantContextResolver, TenantDirectory, TenantSession,
};
use service_core::axum::{
    middleware::from_fn_with_state,
    routing::{get, patch},
    Router,
};
use service_core::middleware::rate_limit::TenantRateLimiter;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Datastore and identity seams the core depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialVerifier>,
    pub memberships: Arc<dyn MembershipStore>,
    pub permission_rpc: Arc<dyn PermissionRpc>,
    pub conditions: Arc<dyn ConditionStore>,
    pub directory: Arc<dyn TenantDirectory>,
    pub session: Arc<dyn TenantSession>,
    pub audit_sink: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// One store serving every seam except credential verification.
    pub fn from_store<D>(store: Arc<D>, credentials: Arc<dyn CredentialVerifier>) -> Self
    where
        D: MembershipStore
            + PermissionRpc
            + ConditionStore
            + TenantDirectory
            + TenantSession
            + AuditSink
            + 'static,
    {
        Self {
            credentials,
            memberships: store.clone(),
            permission_rpc: store.clone(),
            conditions: store.clone(),
            directory: store.clone(),
            session: store.clone(),
            audit_sink: store,
        }
    }

    pub fn from_mock(store: Arc<MockDatastore>) -> Self {
        Self::from_store(store.clone(), store)
    }
}

pub struct TenantGuard {
    config: TenancyConfig,
    permissions: PermissionEngine,
    resolver: TenantContextResolver,
    validator: ContextValidator,
    isolation: IsolationEnforcer,
    audit: AuditLogger,
    memberships: MembershipManager,
    rate_limiter: Option<TenantRateLimiter>,
    pipeline: Pipeline,
    shutdown_token: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl TenantGuard {
    pub fn new(config: TenancyConfig, collaborators: Collaborators) -> Self {
        let permissions = PermissionEngine::new(
            collaborators.permission_rpc.clone(),
            collaborators.conditions.clone(),
            &config.permissions,
        );
        let audit = AuditLogger::new(collaborators.audit_sink.clone(), config.audit.clone());
        let resolver = TenantContextResolver::new(
            collaborators.credentials.clone(),
            collaborators.memberships.clone(),
            permissions.clone(),
        );
        let validator = ContextValidator::new(
            collaborators.directory.clone(),
            collaborators.memberships.clone(),
            permissions.clone(),
            config.validation.clone(),
        );
        let isolation = IsolationEnforcer::new(
            collaborators.session.clone(),
            audit.clone(),
            config.isolation.clone(),
        );
        let memberships = MembershipManager::new(permissions.clone(), audit.clone());
        let rate_limiter = config
            .rate_limit
            .enabled
            .then(|| TenantRateLimiter::new(config.rate_limit.limiter_config()));

        let mut interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(AuditOutcome::new(audit.clone())),
            Arc::new(ResolveContext::new(resolver.clone())),
        ];
        if let Some(limiter) = &rate_limiter {
            interceptors.push(Arc::new(RateLimit::new(limiter.clone())));
        }
        interceptors.push(Arc::new(ValidateContext::new(validator.clone())));
        interceptors.push(Arc::new(EnforceIsolation::new(isolation.clone())));
        interceptors.push(Arc::new(CheckPermission::new(permissions.clone())));

        Self {
            config,
            permissions,
            resolver,
            validator,
            isolation,
            audit,
            memberships,
            rate_limiter,
            pipeline: Pipeline::new(interceptors),
            shutdown_token: CancellationToken::new(),
            maintenance: Mutex::new(None),
        }
    }

    /// Start background work: the audit flush task and rate-limit window
    /// cleanup. Requires a tokio runtime.
    pub fn start(&self) {
        self.audit.start();

        let Some(limiter) = self.rate_limiter.clone() else {
            return;
        };
        let mut maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if maintenance.is_some() {
            return;
        }

        let shutdown = self.shutdown_token.clone();
        let period = limiter.config().window;
        *maintenance = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => limiter.purge_expired(),
                }
            }
        }));
    }

    /// Stop background work and drain the audit queue.
    pub async fn shutdown(&self) -> Result<usize, TenancyError> {
        self.shutdown_token.cancel();
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Rate limit maintenance task ended abnormally");
            }
        }
        self.audit.shutdown().await
    }

    pub fn config(&self) -> &TenancyConfig {
        &self.config
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    pub fn resolver(&self) -> &TenantContextResolver {
        &self.resolver
    }

    pub fn validator(&self) -> &ContextValidator {
        &self.validator
    }

    pub fn isolation(&self) -> &IsolationEnforcer {
        &self.isolation
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn memberships(&self) -> &MembershipManager {
        &self.memberships
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

/// Routes for audit access, member administration and isolation reports,
/// each behind the tenant pipeline with its own permission requirement.
pub fn build_router(guard: Arc<TenantGuard>) -> Router {
    let guarded = |route: RouteGuard| {
        from_fn_with_state(GuardState::new(guard.clone(), route), tenant_guard_middleware)
    };

    let audit_routes = Router::new()
        .route(
            "/organizations/:org_id/audit-logs",
            get(handlers::list_audit_logs),
        )
        .layer(guarded(RouteGuard::any_of(
            "audit",
            "view",
            &["audit:view", "organization:admin"],
        )));

    let export_routes = Router::new()
        .route(
            "/organizations/:org_id/audit-logs/export",
            get(handlers::export_audit_logs),
        )
        .layer(guarded(RouteGuard::any_of(
            "audit",
            "export",
            &["audit:export", "organization:admin"],
        )));

    let member_view_routes = Router::new()
        .route("/organizations/:org_id/members", get(handlers::list_members))
        .layer(guarded(RouteGuard::new("member", "view")));

    let member_manage_routes = Router::new()
        .route(
            "/organizations/:org_id/members/:user_id",
            patch(handlers::update_member).delete(handlers::remove_member),
        )
        .layer(guarded(RouteGuard::new("member", "manage")));

    let isolation_routes = Router::new()
        .route(
            "/organizations/:org_id/isolation",
            get(handlers::isolation_report),
        )
        .layer(guarded(RouteGuard::new("organization", "admin")));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(audit_routes)
        .merge(export_routes)
        .merge(member_view_routes)
        .merge(member_manage_routes)
        .merge(isolation_routes)
        .with_state(guard)
        .layer(TraceLayer::new_for_http())
}

//! Ordered interceptor pipeline wrapped around a resource handler.
//!
//! Interceptors run `before` in list order. A rejection stops the walk and
//! the `after` hooks of every interceptor already entered run in reverse,
//! so the outermost interceptor always sees the terminal outcome. The audit
//! interceptor sits first for that reason.
//!
//! If the request future is dropped before it settles, the entered
//! interceptors get a synchronous `cancelled` call instead, in the same
//! reverse order.

use crate::models::{AuditActor, AuditEvent, PermissionCheck, TenantContext};
use crate::services::audit_logger::AuditLogger;
use crate::services::context_validator::ContextValidator;
use crate::services::error::TenancyError;
use crate::services::isolation::IsolationEnforcer;
use crate::services::permission::PermissionEngine;
use crate::services::tenant_connection::TenantConnection;
use crate::services::tenant_resolver::{ResolutionTrail, TenantContextResolver};
use async_trait::async_trait;
use axum::http::{request::Parts, HeaderMap, HeaderName, HeaderValue};
use futures::FutureExt;
use serde_json::{json, Value};
use service_core::middleware::rate_limit::{RateLimitDecision, TenantRateLimiter, WindowId};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub const HEADER_TENANT_ISOLATION: &str = "x-tenant-isolation";
pub const HEADER_TENANT_ID: &str = "x-tenant-id";
pub const HEADER_CONTEXT_WARNINGS: &str = "x-context-warnings";
pub const HEADER_ISOLATION_DURATION: &str = "x-isolation-duration-ms";
pub const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Request lifecycle through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestStage {
    Unauthenticated,
    ContextResolved,
    ContextValidated,
    IsolationSet,
    PermissionChecked,
    HandlerExecuted,
    Audited,
    Responded,
}

impl RequestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStage::Unauthenticated => "unauthenticated",
            RequestStage::ContextResolved => "context_resolved",
            RequestStage::ContextValidated => "context_validated",
            RequestStage::IsolationSet => "isolation_set",
            RequestStage::PermissionChecked => "permission_checked",
            RequestStage::HandlerExecuted => "handler_executed",
            RequestStage::Audited => "audited",
            RequestStage::Responded => "responded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionRequirement {
    /// `resource:action` of the route itself.
    Single,
    Any(Vec<String>),
    All(Vec<String>),
    /// Tenant context only, no permission check.
    Authenticated,
}

/// What a route needs and how its outcome is audited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteGuard {
    pub resource: String,
    pub action: String,
    pub requirement: PermissionRequirement,
}

impl RouteGuard {
    pub fn new(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            action: action.into(),
            requirement: PermissionRequirement::Single,
        }
    }

    pub fn any_of(
        resource: impl Into<String>,
        action: impl Into<String>,
        permissions: &[&str],
    ) -> Self {
        Self {
            requirement: PermissionRequirement::Any(
                permissions.iter().map(|p| p.to_string()).collect(),
            ),
            ..Self::new(resource, action)
        }
    }

    pub fn all_of(
        resource: impl Into<String>,
        action: impl Into<String>,
        permissions: &[&str],
    ) -> Self {
        Self {
            requirement: PermissionRequirement::All(
                permissions.iter().map(|p| p.to_string()).collect(),
            ),
            ..Self::new(resource, action)
        }
    }

    pub fn authenticated(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            requirement: PermissionRequirement::Authenticated,
            ..Self::new(resource, action)
        }
    }

    pub fn permission(&self) -> String {
        format!("{}:{}", self.resource, self.action)
    }

    pub fn audit_action(&self) -> String {
        format!("{}.{}", self.resource, self.action)
    }
}

/// Values surfaced as response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub isolation_enforced: bool,
    pub tenant_id: Option<String>,
    pub warnings: Vec<String>,
    pub isolation_duration: Option<Duration>,
    pub rate_limit_remaining: Option<u32>,
}

impl Diagnostics {
    pub fn apply(&self, headers: &mut HeaderMap) {
        if self.isolation_enforced {
            insert(headers, HEADER_TENANT_ISOLATION, "enabled");
        }
        if let Some(tenant) = &self.tenant_id {
            insert(headers, HEADER_TENANT_ID, tenant);
        }
        if !self.warnings.is_empty() {
            insert(headers, HEADER_CONTEXT_WARNINGS, &self.warnings.join("; "));
        }
        if let Some(duration) = self.isolation_duration {
            insert(
                headers,
                HEADER_ISOLATION_DURATION,
                &duration.as_millis().to_string(),
            );
        }
        if let Some(remaining) = self.rate_limit_remaining {
            insert(headers, HEADER_RATE_LIMIT_REMAINING, &remaining.to_string());
        }
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(HeaderName::from_static(name), v);
        }
        Err(_) => tracing::debug!(header = name, "Skipping non-ASCII diagnostic header"),
    }
}

/// Per-request state threaded through the interceptors.
pub struct Exchange<'a> {
    pub parts: &'a Parts,
    pub route: &'a RouteGuard,
    pub check_context: Option<Value>,
    pub stage: RequestStage,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub context: Option<TenantContext>,
    /// Tenant-bound connection opened by isolation enforcement.
    pub connection: Option<TenantConnection>,
    pub rate_limit_window: Option<WindowId>,
    pub diagnostics: Diagnostics,
}

impl<'a> Exchange<'a> {
    fn new(parts: &'a Parts, route: &'a RouteGuard, check_context: Option<Value>) -> Self {
        Self {
            parts,
            route,
            check_context,
            stage: RequestStage::Unauthenticated,
            user_id: None,
            organization_id: None,
            context: None,
            connection: None,
            rate_limit_window: None,
            diagnostics: Diagnostics::default(),
        }
    }

    fn require_context(&self) -> Result<&TenantContext, TenancyError> {
        self.context.as_ref().ok_or(TenancyError::Unauthorized)
    }

    fn advance(&mut self, stage: RequestStage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }
}

/// Terminal outcome seen by `after` hooks.
#[derive(Debug)]
pub enum Outcome<'e> {
    Completed,
    Rejected(&'e TenancyError),
    Failed(&'e str),
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, _exchange: &mut Exchange<'_>) -> Result<(), TenancyError> {
        Ok(())
    }

    async fn after(&self, _exchange: &mut Exchange<'_>, _outcome: &Outcome<'_>) {}

    /// The request was dropped before `after` could run. Must not block.
    fn cancelled(&self, _exchange: &Exchange<'_>) {}
}

#[derive(Debug)]
pub enum PipelineError<E> {
    Rejected(TenancyError),
    Handler(E),
}

impl<E: fmt::Display> fmt::Display for PipelineError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Rejected(e) => write!(f, "{}", e),
            PipelineError::Handler(e) => write!(f, "{}", e),
        }
    }
}

pub struct PipelineOutcome<T, E> {
    pub result: Result<T, PipelineError<E>>,
    pub context: Option<TenantContext>,
    pub diagnostics: Diagnostics,
    pub stage: RequestStage,
}

/// Exchange plus how far the walk got. Dropping it unsettled means the
/// request future was cancelled.
struct InFlight<'a> {
    exchange: Exchange<'a>,
    interceptors: &'a [Arc<dyn Interceptor>],
    entered: usize,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::warn!(
            stage = self.exchange.stage.as_str(),
            path = self.exchange.parts.uri.path(),
            "Request cancelled before completion"
        );
        for interceptor in self.interceptors[..self.entered].iter().rev() {
            interceptor.cancelled(&self.exchange);
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
}

impl Pipeline {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: Arc::new(interceptors),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run the interceptors around `handler`. Handler errors are audited and
    /// returned unchanged; a handler panic is audited and then resumed.
    pub async fn run<F, Fut, T, E>(
        &self,
        route: &RouteGuard,
        parts: &Parts,
        check_context: Option<Value>,
        handler: F,
    ) -> PipelineOutcome<T, E>
    where
        F: FnOnce(TenantContext, TenantConnection) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        E: fmt::Display + Send,
        T: Send,
    {
        let mut flight = InFlight {
            exchange: Exchange::new(parts, route, check_context),
            interceptors: self.interceptors.as_slice(),
            entered: 0,
            settled: false,
        };
        let mut rejection = None;

        for interceptor in self.interceptors.iter() {
            flight.entered += 1;
            if let Err(e) = interceptor.before(&mut flight.exchange).await {
                tracing::debug!(
                    interceptor = interceptor.name(),
                    stage = flight.exchange.stage.as_str(),
                    error = %e,
                    "Request rejected"
                );
                rejection = Some(e);
                break;
            }
        }

        let admitted = match rejection {
            Some(e) => Err(e),
            None => match (
                flight.exchange.context.clone(),
                flight.exchange.connection.clone(),
            ) {
                (Some(context), Some(connection)) => Ok((context, connection)),
                (None, _) => Err(TenancyError::Unauthorized),
                (Some(_), None) => Err(TenancyError::IsolationFailure {
                    issues: vec!["No tenant connection for request".to_string()],
                }),
            },
        };

        let result = match admitted {
            Ok((context, connection)) => {
                flight.exchange.advance(RequestStage::PermissionChecked);
                let invoked = AssertUnwindSafe(handler(context, connection))
                    .catch_unwind()
                    .await;
                flight.exchange.advance(RequestStage::HandlerExecuted);
                match invoked {
                    Ok(Ok(value)) => {
                        self.unwind(&mut flight.exchange, flight.entered, &Outcome::Completed)
                            .await;
                        Ok(value)
                    }
                    Ok(Err(e)) => {
                        let message = e.to_string();
                        self.unwind(
                            &mut flight.exchange,
                            flight.entered,
                            &Outcome::Failed(&message),
                        )
                        .await;
                        Err(PipelineError::Handler(e))
                    }
                    Err(panic) => {
                        self.unwind(
                            &mut flight.exchange,
                            flight.entered,
                            &Outcome::Failed("Handler panicked"),
                        )
                        .await;
                        flight.settled = true;
                        std::panic::resume_unwind(panic);
                    }
                }
            }
            Err(err) => {
                self.unwind(&mut flight.exchange, flight.entered, &Outcome::Rejected(&err))
                    .await;
                Err(PipelineError::Rejected(err))
            }
        };

        flight.settled = true;
        flight.exchange.advance(RequestStage::Responded);
        PipelineOutcome {
            result,
            context: flight.exchange.context.take(),
            diagnostics: std::mem::take(&mut flight.exchange.diagnostics),
            stage: flight.exchange.stage,
        }
    }

    async fn unwind(&self, exchange: &mut Exchange<'_>, entered: usize, outcome: &Outcome<'_>) {
        for interceptor in self.interceptors[..entered].iter().rev() {
            interceptor.after(exchange, outcome).await;
        }
    }
}

/// Records exactly one terminal audit entry per request.
pub struct AuditOutcome {
    audit: AuditLogger,
}

impl AuditOutcome {
    pub fn new(audit: AuditLogger) -> Self {
        Self { audit }
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AuditOutcome {
    fn terminal_record(exchange: &Exchange<'_>) -> (AuditActor, AuditEvent) {
        let headers = &exchange.parts.headers;
        let actor = AuditActor {
            organization_id: exchange.organization_id.clone(),
            actor_id: exchange.user_id.clone(),
            actor_type: None,
            ip_address: None,
            user_agent: None,
        }
        .with_client(
            client_ip(headers),
            headers
                .get(axum::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );

        let mut event = AuditEvent::new(exchange.route.audit_action(), &exchange.route.resource)
            .with_metadata(json!({
                "method": exchange.parts.method.as_str(),
                "path": exchange.parts.uri.path(),
                "stage": exchange.stage.as_str(),
            }));
        if let Some(org) = &exchange.organization_id {
            event = event.with_resource_id(org);
        }
        (actor, event)
    }
}

#[async_trait]
impl Interceptor for AuditOutcome {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn after(&self, exchange: &mut Exchange<'_>, outcome: &Outcome<'_>) {
        let (actor, event) = Self::terminal_record(exchange);
        match outcome {
            Outcome::Completed => {
                self.audit.log(&actor, event);
            }
            Outcome::Rejected(err) => {
                self.audit.log_failure(&actor, event, err.to_string());
            }
            Outcome::Failed(message) => {
                self.audit.log_failure(&actor, event, *message);
            }
        }
        exchange.advance(RequestStage::Audited);
    }

    fn cancelled(&self, exchange: &Exchange<'_>) {
        if exchange.stage >= RequestStage::Audited {
            return;
        }
        let (actor, event) = Self::terminal_record(exchange);
        self.audit.log_failure(&actor, event, "Request cancelled");
    }
}

pub struct ResolveContext {
    resolver: TenantContextResolver,
}

impl ResolveContext {
    pub fn new(resolver: TenantContextResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Interceptor for ResolveContext {
    fn name(&self) -> &'static str {
        "resolve"
    }

    async fn before(&self, exchange: &mut Exchange<'_>) -> Result<(), TenancyError> {
        let mut trail = ResolutionTrail::default();
        let resolved = self.resolver.resolve(exchange.parts, &mut trail).await;
        exchange.user_id = trail.user_id;
        exchange.organization_id = trail.organization_id;

        let context = resolved?;
        exchange.diagnostics.tenant_id = Some(context.organization_id.clone());
        exchange.context = Some(context);
        exchange.advance(RequestStage::ContextResolved);
        Ok(())
    }
}

/// Per-tenant load shedding ahead of validation and permission checks.
pub struct RateLimit {
    limiter: TenantRateLimiter,
}

impl RateLimit {
    pub fn new(limiter: TenantRateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Interceptor for RateLimit {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn before(&self, exchange: &mut Exchange<'_>) -> Result<(), TenancyError> {
        let Some(key) = exchange.organization_id.as_deref() else {
            return Ok(());
        };
        match self.limiter.check(key) {
            RateLimitDecision::Allowed { remaining, window } => {
                exchange.diagnostics.rate_limit_remaining = Some(remaining);
                exchange.rate_limit_window = Some(window);
                Ok(())
            }
            RateLimitDecision::Limited { retry_after } => Err(TenancyError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            }),
        }
    }

    async fn after(&self, exchange: &mut Exchange<'_>, outcome: &Outcome<'_>) {
        if let (Outcome::Completed, Some(key), Some(window)) = (
            outcome,
            exchange.organization_id.as_deref(),
            exchange.rate_limit_window,
        ) {
            self.limiter.record_success(key, window);
        }
    }
}

pub struct ValidateContext {
    validator: ContextValidator,
}

impl ValidateContext {
    pub fn new(validator: ContextValidator) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Interceptor for ValidateContext {
    fn name(&self) -> &'static str {
        "validate"
    }

    async fn before(&self, exchange: &mut Exchange<'_>) -> Result<(), TenancyError> {
        let (user_id, org) = {
            let context = exchange.require_context()?;
            (context.user_id.clone(), context.organization_id.clone())
        };
        let result = self.validator.validate_tenant_context(&user_id, &org).await?;
        exchange.diagnostics.warnings = result.warning_messages();
        if !result.is_valid {
            return Err(TenancyError::ContextInvalid {
                errors: result.error_messages(),
            });
        }
        exchange.advance(RequestStage::ContextValidated);
        Ok(())
    }
}

pub struct EnforceIsolation {
    enforcer: IsolationEnforcer,
}

impl EnforceIsolation {
    pub fn new(enforcer: IsolationEnforcer) -> Self {
        Self { enforcer }
    }
}

#[async_trait]
impl Interceptor for EnforceIsolation {
    fn name(&self) -> &'static str {
        "isolation"
    }

    async fn before(&self, exchange: &mut Exchange<'_>) -> Result<(), TenancyError> {
        let context = exchange.require_context()?.clone();
        let receipt = self.enforcer.enforce_context(&context).await?;
        exchange.connection = Some(receipt.connection);
        exchange.diagnostics.isolation_enforced = true;
        exchange.diagnostics.isolation_duration = Some(receipt.duration);
        exchange.advance(RequestStage::IsolationSet);
        Ok(())
    }

    async fn after(&self, exchange: &mut Exchange<'_>, _outcome: &Outcome<'_>) {
        let Some(connection) = exchange.connection.take() else {
            return;
        };
        if let Err(e) = connection.release().await {
            tracing::warn!(
                organization_id = %connection.organization_id(),
                error = %e,
                "Failed to release tenant connection"
            );
        }
    }
}

pub struct CheckPermission {
    engine: PermissionEngine,
}

impl CheckPermission {
    pub fn new(engine: PermissionEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Interceptor for CheckPermission {
    fn name(&self) -> &'static str {
        "permission"
    }

    async fn before(&self, exchange: &mut Exchange<'_>) -> Result<(), TenancyError> {
        let context = exchange.require_context()?.clone();
        let route = exchange.route;

        let denied = match &route.requirement {
            PermissionRequirement::Authenticated => None,
            PermissionRequirement::Single => {
                let mut check = PermissionCheck::new(
                    &context.user_id,
                    &context.organization_id,
                    &route.resource,
                    &route.action,
                );
                if let Some(ctx) = &exchange.check_context {
                    check = check.with_context(ctx.clone());
                }
                let decision = self.engine.check_against(&context.permissions, &check).await?;
                (!decision.allowed).then(|| route.permission())
            }
            PermissionRequirement::Any(list) => {
                (!context.permissions.grants_any(list.as_slice())).then(|| list.join(" | "))
            }
            PermissionRequirement::All(list) if context.permissions.grants_all(list.as_slice()) => None,
            PermissionRequirement::All(list) => list
                .iter()
                .find(|p| !context.permissions.grants_token(p))
                .cloned(),
        };

        if let Some(permission) = denied {
            tracing::info!(
                user_id = %context.user_id,
                organization_id = %context.organization_id,
                permission = %permission,
                "Permission denied"
            );
            return Err(TenancyError::forbidden(permission));
        }

        exchange.advance(RequestStage::PermissionChecked);
        Ok(())
    }
}

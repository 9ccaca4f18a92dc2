//! Axum adapter for the tenant pipeline.
//!
//! Mount per route group with `from_fn_with_state(GuardState, tenant_guard_middleware)`.
//! Handlers behind it read the resolved [`TenantContext`] and the request's
//! [`TenantConnection`] through the extractors below. Responses with a
//! 4xx/5xx status are audited as failures.

use crate::middleware::pipeline::{PipelineError, RouteGuard};
use crate::models::TenantContext;
use crate::services::tenant_connection::TenantConnection;
use crate::TenantGuard;
use serde_json::Value;
use service_core::{
    axum::{
        async_trait,
        extract::{FromRequestParts, Request, State},
        http::{self, request::Parts},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    error::AppError,
};
use std::fmt;
use std::sync::Arc;

/// Attributes for conditional permission checks. Insert it into the request
/// extensions from an earlier layer to have conditions evaluated.
#[derive(Debug, Clone)]
pub struct PermissionContext(pub Value);

#[derive(Clone)]
pub struct GuardState {
    pub guard: Arc<TenantGuard>,
    pub route: Arc<RouteGuard>,
}

impl GuardState {
    pub fn new(guard: Arc<TenantGuard>, route: RouteGuard) -> Self {
        Self {
            guard,
            route: Arc::new(route),
        }
    }
}

struct ErrorResponse(Response);

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request failed with status {}", self.0.status().as_u16())
    }
}

pub async fn tenant_guard_middleware(
    State(state): State<GuardState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let head = request_head(&parts);
    let check_context = parts
        .extensions
        .get::<PermissionContext>()
        .map(|c| c.0.clone());

    let outcome = state
        .guard
        .pipeline()
        .run(&state.route, &head, check_context, move |context, connection| async move {
            let mut request = Request::from_parts(parts, body);
            request.extensions_mut().insert(context);
            request.extensions_mut().insert(connection);
            let response = next.run(request).await;
            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                Err(ErrorResponse(response))
            } else {
                Ok(response)
            }
        })
        .await;

    let mut response = match outcome.result {
        Ok(response) => response,
        Err(PipelineError::Handler(ErrorResponse(response))) => response,
        Err(PipelineError::Rejected(err)) => AppError::from(err).into_response(),
    };
    outcome.diagnostics.apply(response.headers_mut());
    response
}

/// Copy of the request line and headers the interceptors inspect; the
/// original parts travel on to the handler.
fn request_head(parts: &Parts) -> Parts {
    let (mut head, _) = http::Request::new(()).into_parts();
    head.method = parts.method.clone();
    head.uri = parts.uri.clone();
    head.version = parts.version;
    head.headers = parts.headers.clone();
    head
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantContext>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Tenant context not found")))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantConnection
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantConnection>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Tenant connection not found")))
    }
}

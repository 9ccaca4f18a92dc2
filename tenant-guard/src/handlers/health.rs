use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::TenantGuard;

/// Liveness plus cache and audit queue counters.
pub async fn health_check(State(guard): State<Arc<TenantGuard>>) -> Json<Value> {
    let cache = guard.permissions().cache_stats();
    let audit = guard.audit().stats();

    Json(json!({
        "status": "healthy",
        "service": guard.config().service_name,
        "permission_cache": cache,
        "audit": audit,
    }))
}

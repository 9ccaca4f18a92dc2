use service_core::error::AppError;
use thiserror::Error;

/// Uniform message for every resolution failure.
pub const INVALID_TENANT_CONTEXT: &str = "Invalid tenant context";

#[derive(Error, Debug)]
pub enum TenancyError {
    #[error("Invalid tenant context")]
    Unauthorized,

    #[error("Missing permission: {permission}")]
    Forbidden { permission: String },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Tenant context validation failed: {}", .errors.join("; "))]
    ContextInvalid { errors: Vec<String> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tenant isolation check failed: {}", .issues.join("; "))]
    IsolationFailure { issues: Vec<String> },

    #[error("Tenant isolation is disabled at the datastore")]
    IsolationDisabled,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Audit write failed: {0}")]
    Durability(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl TenancyError {
    pub fn forbidden(permission: impl Into<String>) -> Self {
        TenancyError::Forbidden {
            permission: permission.into(),
        }
    }

    /// Isolation failures are security incidents, never retried.
    pub fn is_security_incident(&self) -> bool {
        matches!(
            self,
            TenancyError::IsolationFailure { .. } | TenancyError::IsolationDisabled
        )
    }
}

impl From<TenancyError> for AppError {
    fn from(err: TenancyError) -> Self {
        match err {
            TenancyError::Unauthorized => {
                AppError::Unauthorized(anyhow::anyhow!(INVALID_TENANT_CONTEXT))
            }
            TenancyError::Forbidden { permission } => {
                AppError::Forbidden(anyhow::anyhow!("Missing permission: {}", permission))
            }
            TenancyError::AccessDenied(msg) => AppError::Forbidden(anyhow::anyhow!(msg)),
            TenancyError::ContextInvalid { .. } => {
                AppError::Forbidden(anyhow::anyhow!("Tenant context validation failed"))
            }
            TenancyError::InvalidInput(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            TenancyError::IsolationFailure { .. } => AppError::SecurityViolation,
            TenancyError::IsolationDisabled => {
                AppError::ServiceUnavailable("Tenant isolation unavailable".to_string())
            }
            TenancyError::RateLimited { retry_after_secs } => AppError::TooManyRequests(
                "Rate limit exceeded".to_string(),
                Some(retry_after_secs),
            ),
            TenancyError::Durability(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
            TenancyError::Store(e) => AppError::DatabaseError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_mapping() {
        let cases = [
            (TenancyError::Unauthorized, StatusCode::UNAUTHORIZED),
            (TenancyError::forbidden("workspace:create"), StatusCode::FORBIDDEN),
            (
                TenancyError::ContextInvalid {
                    errors: vec!["Organization is not active".into()],
                },
                StatusCode::FORBIDDEN,
            ),
            (TenancyError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (
                TenancyError::IsolationFailure {
                    issues: vec!["leak".into()],
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (TenancyError::IsolationDisabled, StatusCode::SERVICE_UNAVAILABLE),
            (
                TenancyError::RateLimited {
                    retry_after_secs: 3,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_unauthorized_message_is_uniform() {
        assert_eq!(TenancyError::Unauthorized.to_string(), "Invalid tenant context");
    }

    #[test]
    fn test_forbidden_names_permission() {
        let app: AppError = TenancyError::forbidden("workspace:create").into();
        assert!(app.to_string().contains("workspace:create"));
    }
}

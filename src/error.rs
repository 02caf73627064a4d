use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Failure taxonomy for the query pipeline.
///
/// `Correctable` is the only variant the self-correction loop is allowed to
/// retry; everything else propagates to the caller immediately. Messages on
/// every variant are already sanitized: raw database text only survives
/// classification when it names schema objects, never infrastructure.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("query rejected: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("could not reach the tenant database")]
    Connection(String),

    #[error("connection pool busy, try again shortly")]
    PoolBusy,

    #[error("query exceeded the {seconds}s statement budget")]
    Timeout { seconds: u64 },

    #[error("rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("query failed: {message}")]
    Correctable { message: String },

    #[error("query failed: {message}")]
    Execution { message: String },

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Machine-readable code surfaced at the service boundary.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Auth => "UNAUTHORIZED",
            ServiceError::InvalidRequest(_)
            | ServiceError::Validation(_)
            | ServiceError::Correctable { .. } => "VALIDATION_ERROR",
            ServiceError::Permission(_) => "PERMISSION_DENIED",
            ServiceError::Connection(_) | ServiceError::PoolBusy => "CONNECTION_ERROR",
            ServiceError::Timeout { .. } => "QUERY_TIMEOUT",
            ServiceError::RateLimited { .. } => "RATE_LIMITED",
            ServiceError::Config(_) | ServiceError::Execution { .. } | ServiceError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_)
            | ServiceError::Validation(_)
            | ServiceError::Correctable { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Permission(_) => StatusCode::FORBIDDEN,
            ServiceError::Connection(_) | ServiceError::PoolBusy => StatusCode::BAD_GATEWAY,
            ServiceError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::Config(_) | ServiceError::Execution { .. } | ServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether a regenerated SQL statement might fix this failure.
    pub fn is_correctable(&self) -> bool {
        matches!(self, ServiceError::Correctable { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Message safe to hand to the caller. Internal chains stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Internal(_) => "internal error".to_string(),
            ServiceError::Config(_) => "service misconfigured".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(
            self,
            ServiceError::Internal(_) | ServiceError::Config(_) | ServiceError::Connection(_)
        ) {
            error!(error = %self, "request failed");
        }

        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: self.code(),
                message: self.public_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after() {
            if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn boundary_codes_cover_the_taxonomy() {
        assert_eq!(
            ServiceError::Validation("bad".into()).code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            ServiceError::Permission("role".into()).code(),
            "PERMISSION_DENIED"
        );
        assert_eq!(
            ServiceError::Connection("refused".into()).code(),
            "CONNECTION_ERROR"
        );
        assert_eq!(ServiceError::PoolBusy.code(), "CONNECTION_ERROR");
        assert_eq!(ServiceError::Timeout { seconds: 30 }.code(), "QUERY_TIMEOUT");
        assert_eq!(
            ServiceError::RateLimited {
                retry_after: Duration::from_secs(9)
            }
            .code(),
            "RATE_LIMITED"
        );
        assert_eq!(
            ServiceError::Internal(anyhow::anyhow!("boom")).code(),
            "INTERNAL_ERROR"
        );
    }

    #[test]
    fn internal_details_never_reach_the_public_message() {
        let err = ServiceError::Internal(anyhow::anyhow!("password=hunter2 host=10.0.0.8"));
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn only_correctable_failures_are_retryable() {
        assert!(ServiceError::Correctable {
            message: "column \"ordr_id\" does not exist".into()
        }
        .is_correctable());
        assert!(!ServiceError::Timeout { seconds: 10 }.is_correctable());
        assert!(!ServiceError::Permission("denied".into()).is_correctable());
    }
}

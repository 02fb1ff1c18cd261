//! Host-wide error taxonomy (component C1).
//!
//! Every component surfaces one of these kinds; [`CoreError::status_code`] is the single
//! place that maps a kind onto an HTTP status so every handler responds consistently.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::FailedPrecondition(_) => "failed_precondition",
            CoreError::Unauthenticated(_) => "unauthenticated",
            CoreError::PermissionDenied(_) => "permission_denied",
            CoreError::NotFound(_) => "not_found",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::BadGateway(_) => "bad_gateway",
            CoreError::ResourceExhausted(_) => "resource_exhausted",
            CoreError::DeadlineExceeded(_) => "deadline_exceeded",
            CoreError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            CoreError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            CoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            CoreError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            CoreError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Never includes raw tokens: every variant is constructed from a caller-supplied
        // validation message, never from a credential.
        let body = ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

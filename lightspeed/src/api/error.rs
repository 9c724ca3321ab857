//! API error handling.
//!
//! Rejections that happen before a progress stream is opened are returned as
//! a JSON body with a status code. Failures after that point travel in the
//! stream as an `error` event instead.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// Create a 401 Unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Create a 429 Too Many Requests error.
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "CAPACITY_EXCEEDED", message)
    }

    /// Create a 500 Internal Server Error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    /// Create a 503 Service Unavailable error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Unauthenticated(msg) => ApiError::unauthorized(msg),
            err @ Error::CapacityExceeded { .. } => ApiError::too_many_requests(err.to_string()),
            Error::InvalidRequest(msg) => ApiError::bad_request(msg),
            Error::CapabilityUnavailable(msg) => ApiError::service_unavailable(msg),
            Error::SourceUnavailable(msg) => {
                tracing::warn!("Upstream unavailable: {}", msg);
                ApiError::service_unavailable("An upstream service is unavailable")
            }
            _ => {
                tracing::error!("Unexpected error: {}", err);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::unauthenticated("no token"), StatusCode::UNAUTHORIZED),
            (Error::CapacityExceeded { limit: 5 }, StatusCode::TOO_MANY_REQUESTS),
            (Error::invalid_request("URL is required"), StatusCode::BAD_REQUEST),
            (
                Error::CapabilityUnavailable("no encoder".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (Error::Other("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_capacity_message_is_kept() {
        let err = ApiError::from(Error::CapacityExceeded { limit: 5 });
        assert_eq!(err.code, "CAPACITY_EXCEEDED");
        assert!(err.message.contains("busy"));
    }

    #[test]
    fn test_internal_errors_are_not_leaked() {
        let err = ApiError::from(Error::Other("secret path /var/x".into()));
        assert!(!err.message.contains("/var/x"));
    }
}

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::store::StoreError;

/// Unified application error type following the OpenAI error format.
///
/// Every variant carries its intended HTTP status, so handlers never have to
/// guess a status from message text. The legacy substring mapping from the
/// previous wire contract survives as [`status_for_message`] for errors that
/// reach the dispatcher as bare strings (e.g. recovered worker panics).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    /// The user has not yet approved the device code. Surfaced with the
    /// literal `authorization_pending` so the auth API can answer 202.
    #[error("authorization_pending")]
    AuthPending,

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("request timeout")]
    Timeout,

    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    /// Circuit breaker rejected the request before any work was done.
    #[error("service temporarily unavailable")]
    BreakerOpen,

    /// The request context was cancelled (client disconnect or deadline).
    #[error("request cancelled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// OpenAI-compatible error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::AuthPending => StatusCode::ACCEPTED,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::Network(_) | Self::Canceled | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Validation(_) | Self::PayloadTooLarge(_) => "invalid_request_error",
            Self::Auth(_) | Self::AuthPending => "authentication_error",
            Self::MethodNotAllowed(_) => "invalid_request_error",
            Self::Timeout => "timeout_error",
            Self::Upstream { .. } | Self::Network(_) => "api_error",
            Self::BreakerOpen => "overloaded_error",
            Self::Canceled | Self::Internal(_) => "server_error",
        }
    }

    fn error_code(&self) -> Option<&str> {
        match self {
            Self::AuthPending => Some("authorization_pending"),
            Self::BreakerOpen => Some("circuit_open"),
            Self::Timeout => Some("request_timeout"),
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: self.error_type().to_string(),
                code: self.error_code().map(String::from),
            },
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid JSON: {err}"))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::Auth("user not found in database".to_string()),
            StoreError::Auth(msg) => Self::Auth(msg),
            StoreError::Network(msg) => Self::Network(msg),
            StoreError::Decode(msg) => Self::Network(format!("store decode error: {msg}")),
        }
    }
}

/// Map a bare error message to a status code via the legacy substring
/// contract. Used only where no typed error is available.
pub fn status_for_message(message: &str) -> StatusCode {
    if message.contains("authorization_pending") {
        StatusCode::ACCEPTED
    } else if message.contains("authentication error")
        || message.contains("token validation failed")
    {
        StatusCode::UNAUTHORIZED
    } else if message.contains("bad request") {
        StatusCode::BAD_REQUEST
    } else if message.contains("method not allowed") {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Auth("x".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AppError::AuthPending.status_code(), StatusCode::ACCEPTED);
        assert_eq!(
            AppError::MethodNotAllowed("GET".into()).status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            AppError::PayloadTooLarge("x".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(AppError::Timeout.status_code(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(
            AppError::BreakerOpen.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let err = AppError::Upstream {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err = AppError::Upstream {
            status: 0,
            message: "bogus".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_auth_pending_message_literal() {
        // The 202 translation matches on this exact literal.
        assert_eq!(AppError::AuthPending.to_string(), "authorization_pending");
    }

    #[test]
    fn test_validation_message_prefix() {
        let err = AppError::Validation("empty request body".into());
        assert_eq!(err.to_string(), "bad request: empty request body");
    }

    #[test]
    fn test_status_for_message_substrings() {
        assert_eq!(
            status_for_message("authentication error: no token"),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for_message("token validation failed: expired"),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for_message("bad request: empty request body"),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for_message("method not allowed: GET"),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            status_for_message("something unexpected"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_store_error_conversion() {
        let err: AppError = StoreError::NotFound.into();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err: AppError = StoreError::Network("HTTP 500 response".into()).into();
        assert!(matches!(err, AppError::Network(_)));
    }

    #[test]
    fn test_error_response_shape() {
        let response = ErrorResponse {
            error: ErrorDetail {
                message: "bad request: no model".into(),
                r#type: "invalid_request_error".into(),
                code: None,
            },
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["error"]["message"], "bad request: no model");
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert!(json["error"].get("code").is_none());
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Permission denied")]
    PermissionDenied { details: serde_json::Value },

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Request blocked: {0}")]
    RequestBlocked(String),

    #[error("Gateway timeout")]
    GatewayTimeout,

    #[error("Internal server error")]
    InternalServerError,

    #[error("Cache error: {0}")]
    CacheError(#[from] redis::RedisError),
}

/// Marker extension on responses synthesised by the gateway itself.
///
/// Pipeline stages that short-circuit do so before the response transformer
/// is reached, so their envelopes must come back verbatim; the transformer
/// checks for this marker and leaves such responses untouched.
#[derive(Debug, Clone, Copy)]
pub struct MiddlewareGenerated;

/// The JSON envelope every middleware-generated error is serialised into.
///
/// Handlers use their own success envelopes; this shape is only produced by
/// the gateway layers (auth, rate limit, permission, timeout).
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, error: &str, message: &str) -> Self {
        Self {
            success: false,
            code: Some(status.as_u16()),
            error: error.to_string(),
            message: message.to_string(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message, details) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Authentication required".to_string(),
                None,
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                "Access denied".to_string(),
                None,
            ),
            ApiError::PermissionDenied { details } => (
                StatusCode::FORBIDDEN,
                "permission_denied",
                "Insufficient permission for the target location".to_string(),
                Some(details),
            ),
            ApiError::TooManyRequests => (
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests",
                "Rate limit exceeded. Please try again later.".to_string(),
                None,
            ),
            ApiError::RequestBlocked(kind) => (
                StatusCode::FORBIDDEN,
                "request_blocked",
                format!("Request blocked by security policy ({})", kind),
                None,
            ),
            ApiError::GatewayTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "gateway_timeout",
                "Upstream processing exceeded the request deadline".to_string(),
                None,
            ),
            ApiError::InternalServerError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
                None,
            ),
            ApiError::CacheError(e) => {
                tracing::error!("Redis error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "cache_error",
                    "Cache error occurred".to_string(),
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            code: Some(status.as_u16()),
            error: error_type.to_string(),
            message,
            details,
        });

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(MiddlewareGenerated);
        response
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Unexpected error: {:?}", err);
        ApiError::InternalServerError
    }
}

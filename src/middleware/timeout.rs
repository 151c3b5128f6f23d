use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Duration;

use crate::error::ApiError;

/// Enforce the request deadline. Expiry surfaces as a 504 envelope; once a
/// handler has started streaming bytes the connection is reset by the
/// server instead.
pub async fn timeout_middleware(deadline: Duration, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    match tokio::time::timeout(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(%method, path = %path, deadline_ms = deadline.as_millis() as u64, "request deadline exceeded");
            ApiError::GatewayTimeout.into_response()
        }
    }
}

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;

use crate::middleware::request_id::RequestId;

/// Structured request log: method, path, status, duration, correlation id.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    if status.is_server_error() {
        tracing::error!(%method, path = %path, status = status.as_u16(), duration_ms, request_id = %request_id, "request failed");
    } else if status.is_client_error() {
        tracing::warn!(%method, path = %path, status = status.as_u16(), duration_ms, request_id = %request_id, "request rejected");
    } else {
        tracing::info!(%method, path = %path, status = status.as_u16(), duration_ms, request_id = %request_id, "request completed");
    }

    response
}

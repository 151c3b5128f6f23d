use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header name for the request ID
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Middleware that assigns a correlation ID to every request.
///
/// - If the incoming request already carries an `x-request-id` header, it is
///   preserved (a reverse proxy in front may have generated one).
/// - Otherwise a new ID of the form `<ns-timestamp-hex>-<random64-hex>` is
///   synthesised.
/// - The ID is always copied to the response headers so callers can
///   correlate responses with log entries, and inserted into the request
///   extensions for handlers and later middleware.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    request.extensions_mut().insert(RequestId(id.clone()));

    let _span = tracing::info_span!("request", request_id = %id);

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(&REQUEST_ID_HEADER, value);
    }

    response
}

fn generate_request_id() -> String {
    let ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut suffix = [0u8; 8];
    rand::rng().fill_bytes(&mut suffix);
    format!("{:x}-{}", ns, hex::encode(suffix))
}

/// A typed wrapper around the request ID string, stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_timestamp_and_suffix() {
        let id = generate_request_id();
        let mut parts = id.splitn(2, '-');
        let ts = parts.next().unwrap();
        let suffix = parts.next().unwrap();
        assert!(u128::from_str_radix(ts, 16).is_ok());
        assert_eq!(suffix.len(), 16);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }
}

use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header, response::Parts},
    response::{IntoResponse, Response},
};

use crate::error::ApiError;

/// Cap on how much of a response body the gateway will buffer.
pub const CAPTURE_CAP: usize = 2 * 1024 * 1024;

/// A fully buffered outbound response: status + headers retained, body held
/// in memory. No byte reaches the wire until the holder re-emits it, which
/// is what lets idempotency store and response-transform rewrite bodies
/// after the handler has "written" them. Wrappers stack; the outer one
/// always flushes.
pub struct CapturedResponse {
    pub parts: Parts,
    pub body: Bytes,
}

impl CapturedResponse {
    /// Re-emit the captured response unchanged.
    pub fn into_response(self) -> Response {
        Self::assemble(self.parts, self.body)
    }

    /// Re-emit with a replacement body.
    pub fn with_body(self, body: Bytes) -> Response {
        Self::assemble(self.parts, body)
    }

    fn assemble(mut parts: Parts, body: Bytes) -> Response {
        // The stale length from before buffering must not survive a rewrite.
        parts.headers.remove(header::CONTENT_LENGTH);
        Response::from_parts(parts, Body::from(body))
    }
}

/// Outcome of attempting to buffer a response.
pub enum Captured {
    Complete(CapturedResponse),
    /// Streaming or oversized response; capture is disabled for it and the
    /// caller must skip any capture-dependent behavior.
    Passthrough(Response),
}

pub async fn capture(response: Response, cap: usize) -> Captured {
    let declared_len = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > cap) {
        return Captured::Passthrough(response);
    }

    let (parts, body) = response.into_parts();
    match to_bytes(body, cap).await {
        Ok(bytes) => Captured::Complete(CapturedResponse { parts, body: bytes }),
        Err(err) => {
            // Body stream broke or exceeded the cap mid-flight; the original
            // bytes are gone, so surface a plain failure downstream.
            tracing::warn!(error = %err, "response capture failed");
            Captured::Passthrough(ApiError::InternalServerError.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn captures_status_and_body() {
        let response = (StatusCode::CREATED, "hello").into_response();
        let Captured::Complete(captured) = capture(response, CAPTURE_CAP).await else {
            panic!("expected complete capture");
        };
        assert_eq!(captured.parts.status, StatusCode::CREATED);
        assert_eq!(&captured.body[..], b"hello");
    }

    #[tokio::test]
    async fn default_status_is_ok() {
        let response = Response::new(Body::empty());
        let Captured::Complete(captured) = capture(response, CAPTURE_CAP).await else {
            panic!("expected complete capture");
        };
        assert_eq!(captured.parts.status, StatusCode::OK);
        assert!(captured.body.is_empty());
    }

    #[tokio::test]
    async fn oversized_declared_body_passes_through() {
        let mut response = (StatusCode::OK, "abcdef").into_response();
        response.headers_mut().insert(
            header::CONTENT_LENGTH,
            axum::http::HeaderValue::from_static("6"),
        );
        match capture(response, 3).await {
            Captured::Passthrough(resp) => assert_eq!(resp.status(), StatusCode::OK),
            Captured::Complete(_) => panic!("oversized body must not be buffered"),
        }
    }

    #[tokio::test]
    async fn with_body_replaces_bytes_and_length() {
        let response = (StatusCode::OK, "original").into_response();
        let Captured::Complete(captured) = capture(response, CAPTURE_CAP).await else {
            panic!("expected complete capture");
        };
        let rebuilt = captured.with_body(Bytes::from_static(b"rewritten"));
        assert!(rebuilt.headers().get(header::CONTENT_LENGTH).is_none());
    }
}

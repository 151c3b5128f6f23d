use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::extractors::auth::AuthenticatedUser;
use crate::middleware::auth::query_param;
use crate::middleware::capture::{capture, Captured, CAPTURE_CAP};
use crate::services::StoredResponse;
use crate::AppState;

/// Header/query names a client may supply its own key through.
const KEY_HEADERS: [&str; 2] = ["idempotency-key", "x-idempotency-key"];
const KEY_QUERY_PARAM: &str = "idempotency_key";

/// The key in effect for this request, stored in request extensions.
#[derive(Debug, Clone)]
pub struct IdempotencyKey(pub String);

/// At-most-once replay for mutating requests.
///
/// A repeated request with the same key gets the stored status and body
/// back verbatim with `X-Idempotency-Replayed: true`; the handler is not
/// invoked. Only 2xx outcomes are stored, so failures stay retryable. The
/// store is the contract boundary: it may single-flight concurrent
/// builders, and this layer tolerates either semantics.
pub async fn idempotency_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let config = &state.settings.idempotency;

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let applies = config
        .allowed_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&method))
        && !config.skip_paths.iter().any(|p| path.starts_with(p));
    if !applies {
        return next.run(request).await;
    }

    let (key, mut request) = derive_key(request, config.max_fingerprint_body).await;
    request.extensions_mut().insert(IdempotencyKey(key.clone()));

    // A get failure degrades to a miss; first-write semantics stay intact.
    match state.idempotency.get(&key).await {
        Ok(Some(stored)) => {
            tracing::debug!(key = %key, "idempotency replay");
            return replay(stored, &key);
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "idempotency get failed; treating as miss");
        }
    }

    let response = next.run(request).await;

    match capture(response, CAPTURE_CAP).await {
        Captured::Complete(captured) => {
            // Only 2xx outcomes are replayable.
            if captured.parts.status.is_success() {
                let stored = StoredResponse {
                    status: captured.parts.status.as_u16(),
                    body: captured.body.to_vec(),
                    stored_at: Utc::now(),
                };
                if let Err(err) = state.idempotency.set(&key, &stored, config.ttl).await {
                    // The response is already on its way; nothing to undo.
                    tracing::warn!(key = %key, error = %err, "idempotency set failed");
                }
            }
            let mut response = captured.into_response();
            set_key_header(&mut response, &key);
            response
        }
        // Streaming/oversized responses are never cached.
        Captured::Passthrough(mut response) => {
            set_key_header(&mut response, &key);
            response
        }
    }
}

fn replay(stored: StoredResponse, key: &str) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        stored.body,
    )
        .into_response();
    response
        .headers_mut()
        .insert("x-idempotency-replayed", HeaderValue::from_static("true"));
    set_key_header(&mut response, key);
    response
}

fn set_key_header(response: &mut Response, key: &str) {
    if let Ok(value) = HeaderValue::from_str(key) {
        response.headers_mut().insert("x-idempotency-key", value);
    }
}

/// Client-supplied key wins; otherwise the request is fingerprinted.
async fn derive_key(request: Request, body_cap: usize) -> (String, Request) {
    if let Some(key) = client_key(&request) {
        return (key, request);
    }
    synthesize_key(request, body_cap).await
}

fn client_key(request: &Request) -> Option<String> {
    for name in KEY_HEADERS {
        if let Some(value) = request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Some(value.to_string());
        }
    }
    query_param(request.uri().query().unwrap_or_default(), KEY_QUERY_PARAM)
}

/// First 128 bits of `SHA-256(principal|method|path|query|body)`, hex.
///
/// The body contributes only when its declared length is under the cap; it
/// is restored to the downstream reader verbatim. A read failure degrades
/// to a body-less fingerprint.
async fn synthesize_key(request: Request, body_cap: usize) -> (String, Request) {
    let principal = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|u| u.id.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let query = canonical_query(request.uri().query().unwrap_or_default());

    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    let (request, body_bytes) = if declared_len.is_some_and(|len| len < body_cap) {
        let (parts, body) = request.into_parts();
        match to_bytes(body, body_cap).await {
            Ok(bytes) => {
                let request = Request::from_parts(parts, Body::from(bytes.clone()));
                (request, bytes)
            }
            Err(err) => {
                tracing::warn!(error = %err, "fingerprint body read failed; hashing without body");
                (Request::from_parts(parts, Body::empty()), Bytes::new())
            }
        }
    } else {
        (request, Bytes::new())
    };

    let mut hasher = Sha256::new();
    hasher.update(principal.as_bytes());
    hasher.update(b"|");
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(query.as_bytes());
    hasher.update(b"|");
    hasher.update(&body_bytes);
    let digest = hasher.finalize();

    (hex::encode(&digest[..16]), request)
}

/// Sort the raw `key=value` pairs so equivalent querystrings fingerprint
/// identically.
fn canonical_query(raw_query: &str) -> String {
    let mut pairs: Vec<&str> = raw_query.split('&').filter(|s| !s.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn canonical_query_sorts_pairs() {
        assert_eq!(canonical_query("b=2&a=1"), "a=1&b=2");
        assert_eq!(canonical_query(""), "");
        assert_eq!(canonical_query("a=1"), "a=1");
    }

    #[test]
    fn client_key_prefers_headers_over_query() {
        let mut req = request("/letters?idempotency_key=from-query");
        assert_eq!(client_key(&req).as_deref(), Some("from-query"));

        req.headers_mut()
            .insert("x-idempotency-key", HeaderValue::from_static("from-x"));
        assert_eq!(client_key(&req).as_deref(), Some("from-x"));

        req.headers_mut()
            .insert("idempotency-key", HeaderValue::from_static("from-primary"));
        assert_eq!(client_key(&req).as_deref(), Some("from-primary"));
    }

    #[tokio::test]
    async fn synthesized_key_is_stable_and_128_bits() {
        let (k1, _) = synthesize_key(request("/letters?b=2&a=1"), 10 * 1024).await;
        let (k2, _) = synthesize_key(request("/letters?a=1&b=2"), 10 * 1024).await;
        assert_eq!(k1, k2, "equivalent querystrings must collide");
        assert_eq!(k1.len(), 32, "first 128 bits, hex-encoded");
    }

    #[tokio::test]
    async fn synthesized_key_depends_on_path() {
        let (k1, _) = synthesize_key(request("/letters"), 10 * 1024).await;
        let (k2, _) = synthesize_key(request("/replies"), 10 * 1024).await;
        assert_ne!(k1, k2);
    }

    #[tokio::test]
    async fn body_at_cap_is_excluded_from_fingerprint() {
        let cap = 10 * 1024;
        let payload = vec![b'x'; cap];

        let with_body = |body: Vec<u8>| {
            Request::builder()
                .method("POST")
                .uri("/letters")
                .header(header::CONTENT_LENGTH, body.len().to_string())
                .body(Body::from(body))
                .unwrap()
        };

        // Exactly at the cap: body excluded, so two different oversized
        // bodies produce the same key.
        let (k1, _) = synthesize_key(with_body(payload.clone()), cap).await;
        let (k2, _) = synthesize_key(with_body(vec![b'y'; cap]), cap).await;
        assert_eq!(k1, k2);

        // Under the cap: body participates.
        let (k3, _) = synthesize_key(with_body(b"small-a".to_vec()), cap).await;
        let (k4, _) = synthesize_key(with_body(b"small-b".to_vec()), cap).await;
        assert_ne!(k3, k4);
    }

    #[tokio::test]
    async fn body_is_restored_for_downstream() {
        let req = Request::builder()
            .method("POST")
            .uri("/letters")
            .header(header::CONTENT_LENGTH, "13")
            .body(Body::from(r#"{"title":"a"}"#))
            .unwrap();
        let (_, req) = synthesize_key(req, 10 * 1024).await;
        let bytes = to_bytes(req.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], br#"{"title":"a"}"#);
    }

    #[test]
    fn replay_marks_the_response() {
        let stored = StoredResponse {
            status: 201,
            body: br#"{"id":"L1"}"#.to_vec(),
            stored_at: Utc::now(),
        };
        let response = replay(stored, "k1");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get("x-idempotency-replayed").unwrap(),
            "true"
        );
        assert_eq!(response.headers().get("x-idempotency-key").unwrap(), "k1");
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}

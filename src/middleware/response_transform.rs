use axum::{
    body::Bytes,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use serde_json::Value;

use crate::middleware::capture::{capture, Captured, CAPTURE_CAP};
use crate::AppState;

/// Rewrites JSON response keys from snake_case to camelCase.
///
/// Runs closest to the handler so every earlier capture (idempotency) sees
/// the final bytes. Applies only when the Content-Type contains
/// `application/json` and the path is not skip-listed; a parse failure
/// passes the original bytes through untouched.
pub async fn response_transform_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    // Short-circuit envelopes from other stages come back verbatim.
    if response
        .extensions()
        .get::<crate::error::MiddlewareGenerated>()
        .is_some()
    {
        return response;
    }

    if state
        .settings
        .transform
        .skip_paths
        .iter()
        .any(|p| path.starts_with(p))
    {
        return response;
    }

    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    if !is_json {
        return response;
    }

    match capture(response, CAPTURE_CAP).await {
        Captured::Complete(captured) => match serde_json::from_slice::<Value>(&captured.body) {
            Ok(value) => {
                let rewritten = camelize(value);
                match serde_json::to_vec(&rewritten) {
                    Ok(bytes) => captured.with_body(Bytes::from(bytes)),
                    Err(err) => {
                        tracing::warn!(error = %err, "response re-encode failed; passing original");
                        captured.into_response()
                    }
                }
            }
            Err(_) => captured.into_response(),
        },
        // Streaming responses are not rewritten.
        Captured::Passthrough(response) => response,
    }
}

/// Walk a decoded JSON tree, rewriting every object key. Array elements
/// recurse; primitive values are untouched.
pub fn camelize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (convert_key(&key), camelize(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(camelize).collect()),
        primitive => primitive,
    }
}

fn convert_key(key: &str) -> String {
    // `id` and `ok` are contract keys, preserved verbatim.
    if key == "id" || key == "ok" {
        return key.to_string();
    }
    snake_to_camel(key)
}

/// `user_id` → `userId`: first segment lowercased, subsequent segments
/// title-cased. Keys without interior underscores pass through unchanged.
pub fn snake_to_camel(key: &str) -> String {
    if !key.contains('_') || key.starts_with('_') || key.ends_with('_') {
        return key.to_string();
    }

    let mut out = String::with_capacity(key.len());
    for (i, segment) in key.split('_').filter(|s| !s.is_empty()).enumerate() {
        if i == 0 {
            out.push_str(&segment.to_lowercase());
        } else {
            let mut chars = segment.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_simple_keys() {
        assert_eq!(snake_to_camel("user_id"), "userId");
        assert_eq!(snake_to_camel("op_code"), "opCode");
        assert_eq!(snake_to_camel("is_active"), "isActive");
        assert_eq!(snake_to_camel("created_at_ns"), "createdAtNs");
    }

    #[test]
    fn camel_case_keys_are_identity() {
        for key in ["userId", "opCode", "simple", "HTML"] {
            assert_eq!(snake_to_camel(key), key);
        }
    }

    #[test]
    fn underscore_edges_pass_through() {
        assert_eq!(snake_to_camel("_private"), "_private");
        assert_eq!(snake_to_camel("trailing_"), "trailing_");
    }

    #[test]
    fn walks_nested_objects_and_arrays() {
        let input = json!({
            "user_id": "u1",
            "op_code": "PK5F3D",
            "nested": {"is_active": true},
            "items": [{"letter_id": 1}, {"letter_id": 2}],
        });
        let expected = json!({
            "userId": "u1",
            "opCode": "PK5F3D",
            "nested": {"isActive": true},
            "items": [{"letterId": 1}, {"letterId": 2}],
        });
        assert_eq!(camelize(input), expected);
    }

    #[test]
    fn contract_keys_survive_verbatim() {
        let input = json!({"id": "L1", "ok": true, "other_key": 1});
        let out = camelize(input);
        assert_eq!(out["id"], "L1");
        assert_eq!(out["ok"], true);
        assert_eq!(out["otherKey"], 1);
    }

    #[test]
    fn primitives_are_untouched() {
        assert_eq!(camelize(json!("snake_case_string")), json!("snake_case_string"));
        assert_eq!(camelize(json!(42)), json!(42));
        assert_eq!(camelize(json!(null)), json!(null));
    }

    #[test]
    fn large_integers_survive_the_round_trip() {
        let input: Value = serde_json::from_str(r#"{"big_number":9007199254740993}"#).unwrap();
        let out = serde_json::to_string(&camelize(input)).unwrap();
        assert_eq!(out, r#"{"bigNumber":9007199254740993}"#);
    }
}

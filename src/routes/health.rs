use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct LiveResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: String,
    version: String,
    cache: String,
}

/// Lightweight liveness endpoint for container health checks.
///
/// Intentionally avoids the cache check so periodic probe traffic stays
/// quiet in the logs.
pub async fn live_check() -> Json<LiveResponse> {
    Json(LiveResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn ready_check(State(state): State<AppState>) -> Json<ReadyResponse> {
    let cache_status = match state.redis.clone() {
        Some(mut redis) => match redis::cmd("PING").query_async::<String>(&mut redis).await {
            Ok(_) => "connected".to_string(),
            Err(_) => "disconnected".to_string(),
        },
        None => "not configured".to_string(),
    };

    Json(ReadyResponse {
        status: "ready".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache: cache_status,
    })
}

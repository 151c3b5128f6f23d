use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::extractors::auth::AuthenticatedUser;
use crate::middleware::role_compat::derive_role_context;
use crate::AppState;

/// Mandatory bearer authentication.
///
/// Establishes the principal for the rest of the pipeline; failure
/// short-circuits with a 401 envelope before any handler work.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or(ApiError::Unauthorized)?;

    let claims = state
        .verifier
        .verify(&token)
        .await
        .map_err(|_| ApiError::Unauthorized)?;

    request.extensions_mut().insert(AuthenticatedUser {
        id: claims.principal_id,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

/// Optional authentication: populates the principal when a valid token is
/// present, passes through anonymously otherwise. Routes that must reject
/// unauthenticated requests layer `auth_middleware` instead.
pub async fn optional_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = bearer_token(&request) {
        if let Ok(claims) = state.verifier.verify(&token).await {
            request.extensions_mut().insert(AuthenticatedUser {
                id: claims.principal_id,
                role: claims.role,
            });
        }
    }

    next.run(request).await
}

/// Authentication for WebSocket upgrade endpoints.
///
/// Browsers cannot attach headers to a WebSocket handshake, so the token is
/// sourced from the `token` query parameter first, then the bearer header.
/// Failure closes with a bare 401 (no JSON body, clients drop the
/// handshake. Success populates the same context fields as the HTTP chain,
/// including display role and courier level.
pub async fn ws_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = query_param(request.uri().query().unwrap_or_default(), "token")
        .or_else(|| bearer_token(&request));

    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let claims = match state.verifier.verify(&token).await {
        Ok(claims) => claims,
        Err(err) => {
            tracing::debug!(error = %err, "websocket token rejected");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let user = AuthenticatedUser {
        id: claims.principal_id,
        role: claims.role,
    };
    let (frontend_role, courier_info) = derive_role_context(&state, &user).await;

    request.extensions_mut().insert(user);
    request.extensions_mut().insert(frontend_role);
    if let Some(info) = courier_info {
        request.extensions_mut().insert(info);
    }

    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn query_param(raw_query: &str, name: &str) -> Option<String> {
    raw_query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name && !value.is_empty()).then(|| value.to_string())
    })
}

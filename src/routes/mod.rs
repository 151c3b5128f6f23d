use axum::{
    extract::Request,
    middleware::{from_fn, from_fn_with_state, Next},
    routing::{get, post},
    Router,
};

use crate::{
    middleware::{
        idempotency_middleware, ip_rate_limit, logging::logging_middleware,
        optional_auth_middleware, principal_rate_limit, request_id_middleware,
        response_transform_middleware, role_compat_middleware, security_headers_middleware,
        threat_detection_middleware, timeout::timeout_middleware,
    },
    AppState,
};

mod health;
pub mod security;

/// Build the gateway router: health probes and the CSP violation sink
/// beneath the full middleware stack. The platform's API routers are
/// merged in by the caller before `apply_middleware_stack`.
pub fn gateway_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/healthz", get(health::live_check))
        .route("/readyz", get(health::ready_check))
        .route("/api/security/csp-report", post(security::csp_report));

    apply_middleware_stack(router, &state).with_state(state)
}

/// Apply the canonical pipeline to a router.
///
/// Order, outermost first (axum layers wrap everything added before them,
/// so the list below is layered in reverse):
///
/// | # | stage | short-circuits with |
/// |---|------------------------|---------------------|
/// | 1 | request id             | never               |
/// | 2 | request logging        | never               |
/// | 3 | security headers + CSP | never               |
/// | 4 | request deadline       | 504                 |
/// | 5 | threat detection       | never (observe)     |
/// | 6 | rate limit (IP)        | 429                 |
/// | 7 | auth (optional)        | never               |
/// | 8 | role compatibility     | never               |
/// | 9 | rate limit (principal) | 429                 |
/// | 10| idempotency            | replay on hit       |
/// | 11| response transform     | never               |
///
/// Permission gates are opt-in per route (`require_opcode_permission`);
/// routes that must reject anonymous requests early additionally layer
/// `auth_middleware`. The login limiter (`login_rate_limit`, keyed on the
/// submitted username) is layered onto the auth route group by the caller.
pub fn apply_middleware_stack(router: Router<AppState>, state: &AppState) -> Router<AppState> {
    let ip_limiter = state.ip_limiter.clone();
    let principal_limiter = state.principal_limiter.clone();
    let threat_policy = state.threat_policy;
    let deadline = state.settings.server.request_timeout;

    router
        .layer(from_fn_with_state(
            state.clone(),
            response_transform_middleware,
        ))
        .layer(from_fn_with_state(state.clone(), idempotency_middleware))
        .layer(from_fn(move |request: Request, next: Next| {
            let limiter = principal_limiter.clone();
            async move { principal_rate_limit(limiter, request, next).await }
        }))
        .layer(from_fn_with_state(state.clone(), role_compat_middleware))
        .layer(from_fn_with_state(state.clone(), optional_auth_middleware))
        .layer(from_fn(move |request: Request, next: Next| {
            let limiter = ip_limiter.clone();
            async move { ip_rate_limit(limiter, request, next).await }
        }))
        .layer(from_fn(move |request: Request, next: Next| {
            threat_detection_middleware(threat_policy, request, next)
        }))
        .layer(from_fn(move |request: Request, next: Next| {
            timeout_middleware(deadline, request, next)
        }))
        .layer(from_fn_with_state(
            state.clone(),
            security_headers_middleware,
        ))
        .layer(from_fn(logging_middleware))
        .layer(from_fn(request_id_middleware))
}

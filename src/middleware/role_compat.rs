use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::extractors::auth::AuthenticatedUser;
use crate::AppState;

/// The role string in the frontend's vocabulary, derived from the
/// canonical backend role. Stored in request extensions.
#[derive(Debug, Clone)]
pub struct FrontendRole(pub String);

/// Courier scope attached to the request for the permission engine and
/// response shaping. `managed_prefix` is empty when the resolver knows
/// nothing about the principal; every prefix check then fails.
#[derive(Debug, Clone)]
pub struct CourierInfo {
    pub level: u8,
    pub managed_prefix: String,
}

/// Derives the display role and, for courier roles, the courier scope.
/// The principal itself is never mutated.
pub async fn role_compat_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(user) = request.extensions().get::<AuthenticatedUser>().cloned() {
        let (frontend_role, courier_info) = derive_role_context(&state, &user).await;
        request.extensions_mut().insert(frontend_role);
        if let Some(info) = courier_info {
            request.extensions_mut().insert(info);
        }
    }

    next.run(request).await
}

/// Shared with the WebSocket auth variant, which populates the same fields
/// in a single stage.
pub async fn derive_role_context(
    state: &AppState,
    user: &AuthenticatedUser,
) -> (FrontendRole, Option<CourierInfo>) {
    let frontend_role = FrontendRole(user.role.frontend_role().to_string());

    let Some(level) = user.role.courier_level() else {
        return (frontend_role, None);
    };

    // Resolver failure degrades to an empty managed prefix; the permission
    // engine then denies everything below city scope.
    let record = match state.resolver.resolve(&user.id).await {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(user_id = %user.id, error = %err, "principal resolution failed");
            None
        }
    };

    let managed_prefix = record
        .and_then(|r| r.managed_opcode.or(r.school_code))
        .unwrap_or_default();

    (frontend_role, Some(CourierInfo { level, managed_prefix }))
}

#[cfg(test)]
mod tests {
    use crate::models::Role;

    #[test]
    fn frontend_vocabulary_covers_all_roles() {
        let expected = [
            (Role::User, "user"),
            (Role::CourierLevel1, "courier"),
            (Role::CourierLevel2, "senior_courier"),
            (Role::CourierLevel3, "courier_coordinator"),
            (Role::CourierLevel4, "city_coordinator"),
            (Role::PlatformAdmin, "platform_admin"),
            (Role::SuperAdmin, "super_admin"),
        ];
        for (role, display) in expected {
            assert_eq!(role.frontend_role(), display);
        }
    }
}

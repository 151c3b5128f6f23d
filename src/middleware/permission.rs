use axum::{
    extract::{FromRequestParts, RawPathParams, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use serde_json::json;

use crate::error::ApiError;
use crate::extractors::auth::AuthenticatedUser;
use crate::middleware::auth::query_param;
use crate::middleware::role_compat::CourierInfo;
use crate::models::{Capability, CourierProfile, PermissionSet, Role};

/// The permission set granted for the request's target location, stored in
/// request extensions once a gate has passed.
#[derive(Debug, Clone)]
pub struct OpcodePermissions(pub PermissionSet);

/// Evaluate the capability flags a courier holds over one target location.
///
/// The location code is `AABBCC` (school / area / point); grants compare a
/// prefix of the courier's managed prefix against the target:
///
/// | level | compares | grants |
/// |---|---|---|
/// | 4 (city) | nothing | all |
/// | 3 (school) | `AA` | all |
/// | 2 (area) | `AABB` | all |
/// | 1 (building) | `AABB` | view, edit |
/// | 0 | nothing | none |
///
/// Administrative roles bypass the table entirely. Missing inputs (empty
/// principal, empty target) yield the all-false set.
pub fn evaluate_permissions(role: &Role, profile: &CourierProfile, target: &str) -> PermissionSet {
    if role.is_admin() {
        return PermissionSet::all();
    }
    if profile.id.is_empty() || target.is_empty() {
        return PermissionSet::none();
    }

    let target = target.to_uppercase();
    let prefix = profile.managed_prefix.to_uppercase();

    match profile.level {
        4 => PermissionSet::all(),
        3 if prefix_matches(&prefix, &target, 2) => PermissionSet::all(),
        2 if prefix_matches(&prefix, &target, 4) => PermissionSet::all(),
        1 if prefix_matches(&prefix, &target, 4) => PermissionSet::view_edit(),
        _ => PermissionSet::none(),
    }
}

/// View-only area access: same prefix-length rules, but level 1 is
/// permitted (it can view its own area) and nothing else is granted.
pub fn validate_area_access(role: &Role, profile: &CourierProfile, target: &str) -> bool {
    if role.is_admin() {
        return true;
    }
    if profile.id.is_empty() || target.is_empty() {
        return false;
    }

    let target = target.to_uppercase();
    let prefix = profile.managed_prefix.to_uppercase();

    match profile.level {
        4 => true,
        3 => prefix_matches(&prefix, &target, 2),
        2 | 1 => prefix_matches(&prefix, &target, 4),
        _ => false,
    }
}

fn prefix_matches(prefix: &str, target: &str, len: usize) -> bool {
    prefix.get(..len).is_some_and(|p| target.starts_with(p))
}

/// Gate a route behind one capability over the target location code.
///
/// The target comes from the `opcode` / `op_code` route parameter, falling
/// back to the same-named query parameters. Used per-route:
///
/// ```ignore
/// .route_layer(from_fn(|req, next| {
///     require_opcode_permission(Capability::Edit, req, next)
/// }))
/// ```
pub async fn require_opcode_permission(
    capability: Capability,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .cloned()
        .ok_or(ApiError::Unauthorized)?;

    let profile = courier_profile(&request, &user);

    let (mut parts, body) = request.into_parts();
    let target = extract_target_opcode(&mut parts)
        .await
        .unwrap_or_default()
        .to_uppercase();
    let mut request = Request::from_parts(parts, body);

    let permissions = evaluate_permissions(&user.role, &profile, &target);
    if !permissions.allows(capability) {
        tracing::warn!(
            user_id = %user.id,
            courier_level = profile.level,
            target_opcode = %target,
            "opcode permission denied"
        );
        return Err(ApiError::PermissionDenied {
            details: json!({
                "required_permission": capability.display_label(),
                "courier_level": profile.level,
                "target_opcode": target,
                "managed_prefix": profile.managed_prefix,
            }),
        });
    }

    request
        .extensions_mut()
        .insert(OpcodePermissions(permissions));

    Ok(next.run(request).await)
}

/// Gate a route behind the view-only area-access check.
pub async fn require_area_access(request: Request, next: Next) -> Result<Response, ApiError> {
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .cloned()
        .ok_or(ApiError::Unauthorized)?;

    let profile = courier_profile(&request, &user);

    let (mut parts, body) = request.into_parts();
    let target = extract_target_opcode(&mut parts)
        .await
        .unwrap_or_default()
        .to_uppercase();
    let request = Request::from_parts(parts, body);

    if !validate_area_access(&user.role, &profile, &target) {
        return Err(ApiError::PermissionDenied {
            details: json!({
                "required_permission": Capability::View.display_label(),
                "courier_level": profile.level,
                "target_opcode": target,
                "managed_prefix": profile.managed_prefix,
            }),
        });
    }

    Ok(next.run(request).await)
}

fn courier_profile(request: &Request, user: &AuthenticatedUser) -> CourierProfile {
    let info = request.extensions().get::<CourierInfo>();
    CourierProfile {
        id: user.id.clone(),
        level: info
            .map(|i| i.level)
            .or_else(|| user.role.courier_level())
            .unwrap_or(0),
        managed_prefix: info.map(|i| i.managed_prefix.clone()).unwrap_or_default(),
    }
}

async fn extract_target_opcode(parts: &mut Parts) -> Option<String> {
    if let Ok(params) = RawPathParams::from_request_parts(parts, &()).await {
        for (name, value) in params.iter() {
            if (name == "opcode" || name == "op_code") && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }

    let raw_query = parts.uri.query().unwrap_or_default();
    query_param(raw_query, "opcode").or_else(|| query_param(raw_query, "op_code"))
}

pub mod auth;
pub mod capture;
pub mod idempotency;
pub mod logging;
pub mod permission;
pub mod rate_limit;
pub mod request_id;
pub mod response_transform;
pub mod role_compat;
pub mod security_headers;
pub mod threat_detection;
pub mod timeout;

pub use auth::{auth_middleware, optional_auth_middleware, ws_auth_middleware};
pub use idempotency::{idempotency_middleware, IdempotencyKey};
pub use permission::{require_area_access, require_opcode_permission, OpcodePermissions};
pub use rate_limit::{
    ip_rate_limit, login_rate_limit, principal_rate_limit, RateLimiterSet, TokenBucket,
};
pub use request_id::{request_id_middleware, RequestId};
pub use response_transform::response_transform_middleware;
pub use role_compat::{role_compat_middleware, CourierInfo, FrontendRole};
pub use security_headers::{security_headers_middleware, CspNonce};
pub use threat_detection::{threat_detection_middleware, ThreatFindings, ThreatPolicy};

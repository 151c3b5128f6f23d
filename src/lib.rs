use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use config::Settings;
use middleware::{RateLimiterSet, ThreatPolicy};
use services::{IdempotencyStore, PrincipalResolver, TokenVerifier};

/// Shared gateway state: configuration, collaborator interfaces, and the
/// four rate limiter singletons (general/auth × IP/principal). Limiters
/// are built here rather than in module init blocks so tests get isolated
/// instances.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub redis: Option<redis::aio::ConnectionManager>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub ip_limiter: RateLimiterSet,
    pub auth_ip_limiter: RateLimiterSet,
    pub principal_limiter: RateLimiterSet,
    pub login_limiter: RateLimiterSet,
    pub threat_policy: ThreatPolicy,
}

impl AppState {
    pub fn new(
        settings: Arc<Settings>,
        redis: Option<redis::aio::ConnectionManager>,
        idempotency: Arc<dyn IdempotencyStore>,
        verifier: Arc<dyn TokenVerifier>,
        resolver: Arc<dyn PrincipalResolver>,
    ) -> Self {
        let general = settings.rate_limit.general_policy();
        let auth = settings.rate_limit.auth_policy();

        Self {
            settings,
            redis,
            idempotency,
            verifier,
            resolver,
            ip_limiter: RateLimiterSet::new(general),
            auth_ip_limiter: RateLimiterSet::new(auth),
            principal_limiter: RateLimiterSet::new(general),
            login_limiter: RateLimiterSet::new(auth),
            threat_policy: ThreatPolicy::Observe,
        }
    }

    /// Start the hourly eviction janitors, one per limiter instance.
    pub fn spawn_janitors(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let interval = Duration::from_secs(3600);
        vec![
            self.ip_limiter.clone().spawn_janitor(interval),
            self.auth_ip_limiter.clone().spawn_janitor(interval),
            self.principal_limiter.clone().spawn_janitor(interval),
            self.login_limiter.clone().spawn_janitor(interval),
        ]
    }
}

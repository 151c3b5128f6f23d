use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, RwLock};

use crate::config::RateLimitPolicy;
use crate::error::{ErrorResponse, MiddlewareGenerated};
use crate::extractors::auth::AuthenticatedUser;

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// A refilling token allowance for one key.
///
/// Tokens accrue at `rate` per second up to `burst`; each allowed request
/// deducts one. The count never exceeds the burst capacity, and refill is
/// monotone: regressions of the clock are clamped to zero elapsed time.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed > Duration::ZERO {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
            self.last_refill = now;
        }
    }

    /// Refill to `now`, then deduct a token if one is available.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Whole tokens currently held.
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }

    /// Seconds until at least one token is available.
    pub fn reset_after_secs(&self) -> u64 {
        if self.tokens >= 1.0 || self.rate <= 0.0 {
            0
        } else {
            ((1.0 - self.tokens) / self.rate).ceil() as u64
        }
    }

    /// A bucket back at full capacity has been idle for at least
    /// `burst / rate` seconds, which is the janitor's eviction criterion.
    fn is_full(&self) -> bool {
        self.tokens >= self.burst
    }
}

/// What one `check` observed; feeds the denial headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u64,
    pub reset_after: u64,
}

// ---------------------------------------------------------------------------
// Keyed limiter set
// ---------------------------------------------------------------------------

/// A key→bucket map enforcing one policy.
///
/// The map sits behind a reader-preferring lock: the hot path takes a shared
/// lock and finds an existing bucket; a miss upgrades to the exclusive lock,
/// re-checks, and inserts. Bucket mutation is internal to each bucket.
///
/// Suitable for single-instance deployments; multi-instance deployments
/// behind a load balancer need a shared backend instead.
#[derive(Clone)]
pub struct RateLimiterSet {
    buckets: Arc<RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>>,
    policy: RateLimitPolicy,
}

impl RateLimiterSet {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now()).await
    }

    /// `check` against an explicit instant (deterministic in tests).
    pub async fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        // Fast path: shared lock for an existing bucket.
        let existing = { self.buckets.read().await.get(key).cloned() };

        let bucket = match existing {
            Some(bucket) => bucket,
            None => {
                let mut buckets = self.buckets.write().await;
                // Double-check after acquiring the write lock.
                buckets
                    .entry(key.to_string())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(TokenBucket::new(
                            self.policy.rate,
                            self.policy.burst,
                        )))
                    })
                    .clone()
            }
        };

        let mut bucket = bucket.lock().await;
        let allowed = bucket.allow_at(now);
        RateLimitDecision {
            allowed,
            limit: self.policy.burst,
            remaining: bucket.remaining(),
            reset_after: bucket.reset_after_secs(),
        }
    }

    pub async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Remove buckets whose token count has fully replenished.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();

        buckets.retain(|_key, bucket| match bucket.try_lock() {
            Ok(mut bucket) => {
                bucket.refill(now);
                !bucket.is_full()
            }
            // A contended bucket is in active use.
            Err(_) => true,
        });

        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!(
                "Rate limiter janitor: removed {} idle buckets, {} remaining",
                removed,
                buckets.len()
            );
        }
        removed
    }

    /// Spawn the hourly janitor for this limiter. Each instance runs its own.
    pub fn spawn_janitor(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.evict_idle().await;
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Denial response
// ---------------------------------------------------------------------------

/// Rate limit exceeded: 429 with retry hints.
pub struct RateLimitExceeded {
    pub decision: RateLimitDecision,
    /// Which keying dimension denied, emitted as `X-RateLimit-Type` by the
    /// principal-keyed variants.
    pub limiter_kind: Option<&'static str>,
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse::new(
            StatusCode::TOO_MANY_REQUESTS,
            "too_many_requests",
            "Rate limit exceeded. Please try again later.",
        ));
        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();

        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from_static("60"));
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.decision.limit));
        headers.insert(
            "x-ratelimit-remaining",
            HeaderValue::from(self.decision.remaining),
        );
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from(self.decision.reset_after),
        );
        if let Some(kind) = self.limiter_kind {
            headers.insert("x-ratelimit-type", HeaderValue::from_static(kind));
        }
        response.extensions_mut().insert(MiddlewareGenerated);
        response
    }
}

// ---------------------------------------------------------------------------
// Key extraction
// ---------------------------------------------------------------------------

/// Extract the client IP address from the request.
///
/// Checks (in order): `X-Forwarded-For` first entry, `X-Real-Ip`, the
/// connected peer address, then falls back to 127.0.0.1.
pub fn extract_client_ip(request: &Request) -> IpAddr {
    if let Some(ip) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }

    if let Some(ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }

    if let Some(connect_info) = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return connect_info.0.ip();
    }

    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

// ---------------------------------------------------------------------------
// Axum middleware functions
// ---------------------------------------------------------------------------

/// Per-IP rate limiting, the global throttle every request passes.
pub async fn ip_rate_limit(limiter: RateLimiterSet, request: Request, next: Next) -> Response {
    let ip = extract_client_ip(&request);
    let decision = limiter.check(&format!("ip:{}", ip)).await;

    if !decision.allowed {
        tracing::warn!(client_ip = %ip, "IP rate limit exceeded");
        return RateLimitExceeded {
            decision,
            limiter_kind: None,
        }
        .into_response();
    }

    next.run(request).await
}

/// Per-principal rate limiting with IP fallback.
///
/// When an `AuthenticatedUser` extension is present, the bucket is keyed by
/// user ID, so several principals behind one NAT each get their own budget.
/// Anonymous requests fall back to an IP-keyed bucket in the same map,
/// under the same policy.
pub async fn principal_rate_limit(
    limiter: RateLimiterSet,
    request: Request,
    next: Next,
) -> Response {
    let denied = match request.extensions().get::<AuthenticatedUser>() {
        Some(user) => {
            let decision = limiter.check(&format!("user:{}", user.id)).await;
            (!decision.allowed).then(|| {
                tracing::warn!(user_id = %user.id, "principal rate limit exceeded");
                RateLimitExceeded {
                    decision,
                    limiter_kind: Some("user"),
                }
            })
        }
        None => {
            let ip = extract_client_ip(&request);
            let decision = limiter.check(&format!("ip:{}", ip)).await;
            (!decision.allowed).then(|| RateLimitExceeded {
                decision,
                limiter_kind: None,
            })
        }
    };

    match denied {
        Some(denial) => denial.into_response(),
        None => next.run(request).await,
    }
}

/// Login rate limiting, keyed on the submitted username.
///
/// Keying on the username (rather than the source address) stops one
/// attacker from exhausting the budget of everyone behind a shared NAT,
/// and stops a distributed attacker from spreading one account's attempts
/// across many addresses. Falls back to the client IP when no username can
/// be read from the JSON body.
pub async fn login_rate_limit(limiter: RateLimiterSet, request: Request, next: Next) -> Response {
    let (key, kind, request) = login_key(request).await;
    let decision = limiter.check(&key).await;

    if !decision.allowed {
        tracing::warn!(key = %key, "login rate limit exceeded");
        return RateLimitExceeded {
            decision,
            limiter_kind: Some(kind),
        }
        .into_response();
    }

    next.run(request).await
}

/// Peek the JSON body for a `username` field, restoring the body verbatim.
async fn login_key(request: Request) -> (String, &'static str, Request) {
    const LOGIN_BODY_CAP: usize = 10 * 1024;

    let ip = extract_client_ip(&request);
    let declared_len = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    if !declared_len.is_some_and(|len| len < LOGIN_BODY_CAP) {
        return (format!("ip:{}", ip), "login", request);
    }

    let (parts, body) = request.into_parts();
    match to_bytes(body, LOGIN_BODY_CAP).await {
        Ok(bytes) => {
            let username = serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|v| v.get("username").and_then(|u| u.as_str()).map(String::from));
            let request = Request::from_parts(parts, Body::from(bytes));
            match username {
                Some(name) if !name.is_empty() => (format!("login:{}", name), "login", request),
                _ => (format!("ip:{}", ip), "login", request),
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "login body unreadable; keying on client IP");
            (
                format!("ip:{}", ip),
                "login",
                Request::from_parts(parts, Body::empty()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rate: f64, burst: u32) -> RateLimitPolicy {
        RateLimitPolicy { rate, burst }
    }

    #[test]
    fn burst_is_consumed_then_denied() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 3);

        assert!(bucket.allow_at(start));
        assert!(bucket.allow_at(start));
        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start));
        assert!(!bucket.allow_at(start));
        assert_eq!(bucket.remaining(), 0);
    }

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2.0, 4);
        for _ in 0..4 {
            assert!(bucket.allow_at(start));
        }
        assert!(!bucket.allow_at(start));

        // 2 tokens/s: after one second exactly two requests pass.
        let later = start + Duration::from_secs(1);
        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn tokens_never_exceed_burst() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 5);
        assert!(bucket.allow_at(start));

        // A long idle period refills to capacity, not beyond.
        let later = start + Duration::from_secs(3600);
        bucket.refill(later);
        assert_eq!(bucket.remaining(), 5);
    }

    #[test]
    fn clock_regression_grants_nothing() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 2);
        let later = start + Duration::from_secs(10);

        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        // Going backwards in time must not mint tokens.
        assert!(!bucket.allow_at(start));
        assert_eq!(bucket.remaining(), 0);
    }

    #[test]
    fn reset_after_reflects_refill_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(0.1, 1);
        assert!(bucket.allow_at(start));
        // One token at 0.1/s is 10 seconds away.
        assert_eq!(bucket.reset_after_secs(), 10);
    }

    #[tokio::test]
    async fn set_creates_buckets_lazily_per_key() {
        let set = RateLimiterSet::new(policy(10.0, 2));
        assert_eq!(set.bucket_count().await, 0);

        let now = Instant::now();
        assert!(set.check_at("ip:192.0.2.1", now).await.allowed);
        assert!(set.check_at("ip:192.0.2.2", now).await.allowed);
        assert_eq!(set.bucket_count().await, 2);
    }

    #[tokio::test]
    async fn keys_are_throttled_independently() {
        let set = RateLimiterSet::new(policy(1.0, 1));
        let now = Instant::now();

        assert!(set.check_at("user:u1", now).await.allowed);
        assert!(!set.check_at("user:u1", now).await.allowed);
        // u2's bucket is untouched by u1's exhaustion.
        assert!(set.check_at("user:u2", now).await.allowed);
    }

    #[tokio::test]
    async fn decision_carries_denial_headers_inputs() {
        let set = RateLimiterSet::new(policy(10.0, 3));
        let now = Instant::now();
        for _ in 0..3 {
            set.check_at("ip:192.0.2.1", now).await;
        }
        let decision = set.check_at("ip:192.0.2.1", now).await;
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_after >= 1);
    }

    #[tokio::test]
    async fn janitor_evicts_only_full_buckets() {
        let set = RateLimiterSet::new(policy(1000.0, 1));
        // Consume, so the bucket refills to full almost immediately.
        set.check("ip:192.0.2.1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let removed = set.evict_idle().await;
        assert_eq!(removed, 1);
        assert_eq!(set.bucket_count().await, 0);

        // A freshly drained bucket with a slow refill survives.
        let slow = RateLimiterSet::new(policy(0.001, 1));
        slow.check("ip:192.0.2.2").await;
        assert_eq!(slow.evict_idle().await, 0);
        assert_eq!(slow.bucket_count().await, 1);
    }

    #[test]
    fn denial_response_sets_retry_headers() {
        let response = RateLimitExceeded {
            decision: RateLimitDecision {
                allowed: false,
                limit: 100,
                remaining: 0,
                reset_after: 7,
            },
            limiter_kind: Some("user"),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "60");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "7");
        assert_eq!(headers.get("x-ratelimit-type").unwrap(), "user");
    }
}

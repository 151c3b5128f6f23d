use anyhow::Result;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    /// Request deadline; expiry surfaces as a 504 envelope.
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub is_development: bool,
    pub frontend_url: String,
    pub websocket_url: String,
    pub trusted_cdns: Vec<String>,
    pub enable_hsts: bool,
    pub enable_csp_reporting: bool,
    pub csp_report_uri: String,
    /// Path prefixes that receive cache-busting headers (auth + admin APIs).
    pub sensitive_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl: Duration,
    /// Path prefixes the idempotency layer never touches.
    pub skip_paths: Vec<String>,
    /// Methods that are fingerprinted and replayed.
    pub allowed_methods: Vec<String>,
    /// Bodies at or above this size are excluded from the fingerprint.
    pub max_fingerprint_body: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Tokens per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub general: RateLimitPolicy,
    pub auth: RateLimitPolicy,
    pub test_mode: bool,
}

impl RateLimitConfig {
    /// Effective policies after the test-mode override.
    pub fn general_policy(&self) -> RateLimitPolicy {
        if self.test_mode {
            RateLimitPolicy {
                rate: 1000.0,
                burst: 10_000,
            }
        } else {
            self.general
        }
    }

    pub fn auth_policy(&self) -> RateLimitPolicy {
        if self.test_mode {
            RateLimitPolicy {
                rate: 1000.0,
                burst: 10_000,
            }
        } else {
            self.auth
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Path prefixes whose response bodies are passed through untouched.
    ///
    /// Responses whose serialisation depends on explicit nulls or
    /// discriminated unions must be listed here; the naive key rewrite
    /// would flatten them.
    pub skip_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub security: SecurityConfig,
    pub idempotency: IdempotencyConfig,
    pub rate_limit: RateLimitConfig,
    pub transform: TransformConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    env_or(key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Settings {
    pub fn new() -> Result<Self> {
        dotenvy::dotenv().ok();

        let is_development = env_or("APP_ENV", "development") != "production";

        Ok(Self {
            server: ServerConfig {
                port: env_or("PORT", "8080").parse().unwrap_or(8080),
                host: env_or("HOST", "0.0.0.0"),
                request_timeout: Duration::from_secs(
                    env_or("REQUEST_TIMEOUT_SECS", "30").parse().unwrap_or(30),
                ),
            },
            redis: RedisConfig {
                url: env_or("REDIS_URL", "redis://localhost:6379"),
            },
            security: SecurityConfig {
                is_development,
                frontend_url: env_or("FRONTEND_URL", "http://localhost:3000"),
                websocket_url: env_or("WEBSOCKET_URL", "wss://api.courier.example.com"),
                trusted_cdns: env_list(
                    "TRUSTED_CDNS",
                    "https://cdn.jsdelivr.net,https://unpkg.com",
                ),
                enable_hsts: env_bool("ENABLE_HSTS", true),
                enable_csp_reporting: env_bool("ENABLE_CSP_REPORTING", false),
                csp_report_uri: env_or("CSP_REPORT_URI", "/api/security/csp-report"),
                sensitive_paths: env_list("SENSITIVE_PATHS", "/api/auth/,/api/admin/"),
            },
            idempotency: IdempotencyConfig {
                ttl: Duration::from_secs(
                    env_or("IDEMPOTENCY_TTL_SECS", "86400").parse().unwrap_or(86_400),
                ),
                skip_paths: env_list(
                    "IDEMPOTENCY_SKIP_PATHS",
                    "/api/auth/,/api/security/csp-report,/healthz,/readyz",
                ),
                allowed_methods: env_list("IDEMPOTENCY_METHODS", "POST,PUT,PATCH"),
                max_fingerprint_body: 10 * 1024,
            },
            rate_limit: RateLimitConfig {
                general: RateLimitPolicy {
                    rate: env_or("RATE_LIMIT_GENERAL_RATE", "10").parse().unwrap_or(10.0),
                    burst: env_or("RATE_LIMIT_GENERAL_BURST", "100").parse().unwrap_or(100),
                },
                auth: RateLimitPolicy {
                    rate: env_or("RATE_LIMIT_AUTH_RATE", "0.1").parse().unwrap_or(0.1),
                    burst: env_or("RATE_LIMIT_AUTH_BURST", "20").parse().unwrap_or(20),
                },
                test_mode: env_bool("TEST_MODE", false),
            },
            transform: TransformConfig {
                skip_paths: env_list(
                    "TRANSFORM_SKIP_PATHS",
                    "/api/admin/settings,/api/security/csp-report",
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_relaxes_policies() {
        let config = RateLimitConfig {
            general: RateLimitPolicy { rate: 10.0, burst: 100 },
            auth: RateLimitPolicy { rate: 0.1, burst: 20 },
            test_mode: true,
        };
        assert_eq!(config.general_policy().burst, 10_000);
        assert_eq!(config.auth_policy().burst, 10_000);
    }

    #[test]
    fn strict_policies_without_test_mode() {
        let config = RateLimitConfig {
            general: RateLimitPolicy { rate: 10.0, burst: 100 },
            auth: RateLimitPolicy { rate: 0.1, burst: 20 },
            test_mode: false,
        };
        assert_eq!(config.general_policy().burst, 100);
        assert!((config.auth_policy().rate - 0.1).abs() < f64::EPSILON);
    }
}

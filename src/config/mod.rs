mod settings;

pub use settings::{
    IdempotencyConfig, RateLimitConfig, RateLimitPolicy, RedisConfig, SecurityConfig,
    ServerConfig, Settings, TransformConfig,
};

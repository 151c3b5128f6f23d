mod cache_service;
mod identity;

pub use cache_service::{
    IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore, StoredResponse,
};
pub use identity::{
    Claims, DevTokenVerifier, PrincipalResolver, StaticPrincipalResolver, TokenVerifier,
};

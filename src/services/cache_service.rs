use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A captured handler outcome, replayed verbatim on an idempotency-key hit.
///
/// Read-only after the first write; only 2xx outcomes are ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Narrow store contract the idempotency layer consumes.
///
/// Implementations must be linearizable at key granularity. They MAY
/// single-flight concurrent builders for one key; the middleware tolerates
/// either semantics (a losing concurrent request simply recomputes).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredResponse>>;

    /// Store with server-side TTL jitter so a burst of first-writes does not
    /// expire as a burst.
    async fn set(&self, key: &str, value: &StoredResponse, ttl: Duration) -> anyhow::Result<()>;
}

/// Redis-backed store. Values are JSON documents under `idem:{key}`.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    redis: redis::aio::ConnectionManager,
}

impl RedisIdempotencyStore {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    fn storage_key(key: &str) -> String {
        format!("idem:{}", key)
    }
}

/// TTL plus up to 10% random jitter.
fn jittered(ttl: Duration) -> Duration {
    let jitter_cap = (ttl.as_secs() / 10).max(1);
    let jitter = rand::rng().random_range(0..=jitter_cap);
    ttl + Duration::from_secs(jitter)
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredResponse>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(Self::storage_key(key)).await?;
        Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
    }

    async fn set(&self, key: &str, value: &StoredResponse, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(value)?;
        conn.set_ex::<_, _, ()>(Self::storage_key(key), serialized, jittered(ttl).as_secs())
            .await?;
        Ok(())
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<RwLock<HashMap<String, (StoredResponse, Instant)>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<StoredResponse>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|(value, expires_at)| {
            if Instant::now() < *expires_at {
                Some(value.clone())
            } else {
                None
            }
        }))
    }

    async fn set(&self, key: &str, value: &StoredResponse, ttl: Duration) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            (value.clone(), Instant::now() + jittered(ttl)),
        );
        Ok(())
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use redis::AsyncCommands;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const MEMORY_CACHE_MAX_ENTRIES: u64 = 100_000;

/// Keyed by normalized ISBN; a value is either absent or the most recent
/// successfully fetched statistics for that ISBN. Each `set` is one atomic
/// write with the backend's fixed TTL.
#[async_trait]
pub trait StatsCache: Send + Sync {
    async fn get(&self, isbn: &str) -> Result<Option<Value>>;
    async fn set(&self, isbn: &str, stats: &Value) -> Result<()>;
}

/// In-process backend on a moka TTL cache.
pub struct MemoryStatsCache {
    cache: Cache<String, Arc<Value>>,
}

impl MemoryStatsCache {
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(MEMORY_CACHE_MAX_ENTRIES)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl StatsCache for MemoryStatsCache {
    async fn get(&self, isbn: &str) -> Result<Option<Value>> {
        Ok(self.cache.get(isbn).await.map(|v| (*v).clone()))
    }

    async fn set(&self, isbn: &str, stats: &Value) -> Result<()> {
        self.cache
            .insert(isbn.to_string(), Arc::new(stats.clone()))
            .await;
        Ok(())
    }
}

/// Distributed backend; entries expire server-side via `SET ... EX`.
pub struct RedisStatsCache {
    manager: redis::aio::ConnectionManager,
    ttl_secs: u64,
}

impl RedisStatsCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self {
            manager,
            ttl_secs: ttl.as_secs().max(1),
        })
    }
}

#[async_trait]
impl StatsCache for RedisStatsCache {
    async fn get(&self, isbn: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn
            .get(isbn)
            .await
            .with_context(|| format!("Redis GET failed for {isbn}"))?;

        match raw {
            Some(payload) => {
                let value = serde_json::from_str(&payload)
                    .with_context(|| format!("Corrupt cached JSON for {isbn}"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, isbn: &str, stats: &Value) -> Result<()> {
        let payload = serde_json::to_string(stats)?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(isbn, payload, self.ttl_secs)
            .await
            .with_context(|| format!("Redis SET failed for {isbn}"))?;
        Ok(())
    }
}

/// Pick the backend from configuration: `REDIS_URL` set means the shared
/// Redis cache, otherwise the in-process one.
pub async fn build_cache(redis_url: Option<&str>, ttl: Duration) -> Result<Arc<dyn StatsCache>> {
    match redis_url {
        Some(url) => {
            info!(ttl_secs = ttl.as_secs(), "using Redis statistics cache");
            Ok(Arc::new(RedisStatsCache::connect(url, ttl).await?))
        }
        None => {
            info!(ttl_secs = ttl.as_secs(), "using in-process statistics cache");
            Ok(Arc::new(MemoryStatsCache::new(ttl)))
        }
    }
}

use crate::core::errors::NormalizedError;
use crate::core::traits::ResponseCache;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// In-process `ResponseCache` with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Value, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn ResponseCache> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        hit
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
    }
}

/// Serve `key` from the cache when possible, otherwise fetch and store it.
///
/// Without a cache this is exactly `fetch()`. Fetch errors are never cached.
pub async fn memoize<F, Fut>(
    cache: Option<&dyn ResponseCache>,
    key: &str,
    ttl: Duration,
    fetch: F,
) -> Result<Value, NormalizedError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<Value, NormalizedError>> + Send,
{
    let Some(cache) = cache else {
        return fetch().await;
    };
    if let Some(hit) = cache.get(key).await {
        trace!(key, "cache hit");
        return Ok(hit);
    }
    let value = fetch().await?;
    cache.set(key, value.clone(), ttl).await;
    Ok(value)
}

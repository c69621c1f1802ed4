//! Redis byte cache for playlists and segments.
//!
//! Every entry is a value key plus a `{key}:meta` JSON sidecar holding the
//! content type; both share the same TTL. Hit/miss counters are per-process.

use crate::error::CacheError;
use crate::ports::cache::{CachedPayload, CacheStats, StreamCachePort};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::pool::RedisPool;

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    content_type: String,
    size: usize,
    cached_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
}

#[derive(Clone)]
pub struct RedisStreamCache {
    pool: RedisPool,
    counters: Arc<Counters>,
}

impl RedisStreamCache {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            counters: Arc::new(Counters::default()),
        }
    }

    fn meta_key(key: &str) -> String {
        format!("{}:meta", key)
    }
}

#[async_trait]
impl StreamCachePort for RedisStreamCache {
    async fn get(&self, key: &str) -> Result<Option<CachedPayload>, CacheError> {
        let mut conn = self.pool.pool.get().await?;
        let data: Option<Vec<u8>> = conn.get(key).await?;
        let Some(data) = data else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let meta_json: Option<String> = conn.get(Self::meta_key(key)).await?;
        let content_type = meta_json
            .and_then(|json| serde_json::from_str::<CacheMeta>(&json).ok())
            .map(|meta| meta.content_type)
            .unwrap_or_else(|| String::from("application/octet-stream"));

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CachedPayload {
            data: Bytes::from(data),
            content_type,
        }))
    }

    async fn put(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        ttl_secs: u64,
    ) -> Result<(), CacheError> {
        let meta = CacheMeta {
            content_type: content_type.to_string(),
            size: data.len(),
            cached_at: Utc::now(),
        };
        let meta_json = serde_json::to_string(&meta)?;

        let mut conn = self.pool.pool.get().await?;
        conn.set_ex::<_, _, ()>(key, data, ttl_secs).await?;
        conn.set_ex::<_, _, ()>(Self::meta_key(key), meta_json, ttl_secs)
            .await?;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.pool.pool.get().await?;
        conn.del::<_, ()>(&[key.to_string(), Self::meta_key(key)])
            .await?;
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

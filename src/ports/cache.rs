use crate::error::CacheError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

/// A cached payload with the metadata mirrored from its `{key}:meta` sidecar.
#[derive(Debug, Clone)]
pub struct CachedPayload {
    pub data: Bytes,
    pub content_type: String,
}

/// Point-in-time view of the per-process cache counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub hit_rate: f64,
}

/// TTL-governed byte cache in front of object storage. Failures here must
/// never fail a read; callers log and fall through to storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamCachePort: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedPayload>, CacheError>;

    async fn put(
        &self,
        key: &str,
        data: &[u8],
        content_type: &str,
        ttl_secs: u64,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Per-process hit/miss counters since startup.
    fn stats(&self) -> CacheStats;
}

/// Cache key for a playlist; `variant` is `master` or the bitrate.
pub fn playlist_key(chapter_id: &str, variant: &str) -> String {
    format!("stream:playlist:{}:{}", chapter_id, variant)
}

/// Cache key for a segment payload.
pub fn segment_key(segment_id: &str) -> String {
    format!("stream:segment:{}", segment_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(playlist_key("ch-1", "master"), "stream:playlist:ch-1:master");
        assert_eq!(playlist_key("ch-1", "128"), "stream:playlist:ch-1:128");
        assert_eq!(segment_key("ch-1_128_004"), "stream:segment:ch-1_128_004");
    }
}

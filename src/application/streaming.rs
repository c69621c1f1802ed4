//! Streaming read path: playlists and segments served through the cache
//! with object storage behind it, and the status/preload/analytics
//! operations next to them.
//!
//! Cache trouble is never allowed to fail a read; every cache call here is
//! logged and falls through to storage.

use crate::domain::hls::{
    parse_segment_index, segment_file_name, segment_id, MasterPlaylist, MediaPlaylist,
    PLAYLIST_MIME, SEGMENT_MIME,
};
use crate::domain::model::JobStatus;
use crate::error::{Error, Result, StorageError};
use crate::ports::cache::{playlist_key, segment_key, CacheStats, StreamCachePort};
use crate::ports::repository::{JobRepository, RenditionRepository};
use crate::ports::storage::StoragePort;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Bitrate assumed when a client states no preference at all.
const DEFAULT_BITRATE: u32 = 128;

#[derive(Clone)]
pub struct StreamingOptions {
    pub cache_ttl_secs: u64,
    pub segment_duration: u32,
    /// The configured ladder, used to tell `partial` from `completed`
    pub configured_bitrates: Vec<u32>,
    pub preload_limit: usize,
}

#[derive(Debug, Serialize)]
pub struct StreamingStatus {
    pub chapter_id: String,
    pub available_bitrates: Vec<u32>,
    pub transcoding_status: String,
    pub can_stream: bool,
    pub estimated_bandwidth: u64,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
    pub cache: CacheStats,
}

pub struct StreamingService {
    storage: Arc<dyn StoragePort>,
    cache: Arc<dyn StreamCachePort>,
    jobs: Arc<dyn JobRepository>,
    renditions: Arc<dyn RenditionRepository>,
    options: StreamingOptions,
}

impl StreamingService {
    pub fn new(
        storage: Arc<dyn StoragePort>,
        cache: Arc<dyn StreamCachePort>,
        jobs: Arc<dyn JobRepository>,
        renditions: Arc<dyn RenditionRepository>,
        options: StreamingOptions,
    ) -> Self {
        Self {
            storage,
            cache,
            jobs,
            renditions,
            options,
        }
    }

    /// On-the-fly master playlist over the chapter's completed renditions,
    /// with the recommended variant annotated for the client.
    pub async fn master_playlist(
        &self,
        chapter_id: &str,
        client_bandwidth: Option<u64>,
        preferred_bitrate: Option<u32>,
    ) -> Result<String> {
        let available = self.renditions.completed_bitrates(chapter_id).await?;
        if available.is_empty() {
            return Err(Error::NoRenditions(chapter_id.to_string()));
        }

        let recommended = select_recommended(&available, client_bandwidth, preferred_bitrate);
        let body = MasterPlaylist::new(available)
            .with_recommended(recommended)
            .render();

        self.cache_put(
            &playlist_key(chapter_id, "master"),
            body.as_bytes(),
            PLAYLIST_MIME,
        )
        .await;
        Ok(body)
    }

    /// Variant playlist for one bitrate, regenerated from the stored
    /// segment listing on cache miss.
    pub async fn variant_playlist(&self, chapter_id: &str, bitrate: u32) -> Result<String> {
        let rendition = self.completed_rendition(chapter_id, bitrate).await?;

        let key = playlist_key(chapter_id, &bitrate.to_string());
        if let Some(cached) = self.cache_get(&key).await {
            return Ok(String::from_utf8_lossy(&cached).into_owned());
        }

        let mut playlist = MediaPlaylist::new(self.options.segment_duration);
        for object in self.storage.list(&rendition.segments_path).await? {
            let Some(name) = object.rsplit('/').next() else {
                continue;
            };
            if name.starts_with("segment_") && name.ends_with(".ts") {
                playlist.add_segment(self.options.segment_duration as f64, name.to_string());
            }
        }
        let body = playlist.render();

        self.cache_put(&key, body.as_bytes(), PLAYLIST_MIME).await;
        Ok(body)
    }

    /// One MPEG-TS segment, cache-through.
    pub async fn segment(
        &self,
        chapter_id: &str,
        bitrate: u32,
        requested_segment: &str,
    ) -> Result<Bytes> {
        let rendition = self.completed_rendition(chapter_id, bitrate).await?;

        let index = parse_segment_index(requested_segment)
            .ok_or_else(|| Error::SegmentNotFound(requested_segment.to_string()))?;
        let canonical = segment_id(chapter_id, bitrate, index);

        let key = segment_key(&canonical);
        if let Some(cached) = self.cache_get(&key).await {
            return Ok(cached);
        }

        let object_key = format!("{}/{}", rendition.segments_path, segment_file_name(index));
        let data = match self.storage.read(&object_key).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Err(Error::SegmentNotFound(canonical)),
            Err(err) => return Err(err.into()),
        };

        self.cache_put(&key, &data, SEGMENT_MIME).await;
        Ok(data)
    }

    pub async fn status(&self, chapter_id: &str) -> Result<StreamingStatus> {
        let available = self.renditions.completed_bitrates(chapter_id).await?;
        let latest = self.jobs.latest_for_chapter(chapter_id).await?;

        let transcoding_status = if !available.is_empty()
            && self
                .options
                .configured_bitrates
                .iter()
                .any(|b| !available.contains(b))
        {
            "partial".to_string()
        } else {
            latest
                .map(|job| job.status.as_str().to_string())
                .unwrap_or_else(|| "not_started".to_string())
        };

        Ok(StreamingStatus {
            chapter_id: chapter_id.to_string(),
            can_stream: !available.is_empty(),
            estimated_bandwidth: available.iter().max().map(|b| *b as u64 * 1000).unwrap_or(0),
            available_bitrates: available,
            transcoding_status,
        })
    }

    /// Warm the cache with the first segments of a rendition. Returns how
    /// many were loaded; loading the same rendition twice writes the same
    /// keys with the same bytes.
    pub async fn preload(&self, chapter_id: &str, bitrate: Option<u32>) -> Result<usize> {
        let bitrate = bitrate.unwrap_or(DEFAULT_BITRATE);
        let rendition = self.completed_rendition(chapter_id, bitrate).await?;

        let mut loaded = 0;
        let objects = self.storage.list(&rendition.segments_path).await?;
        let segments = objects
            .iter()
            .filter(|object| object.ends_with(".ts"))
            .take(self.options.preload_limit);

        for object in segments {
            let Some(index) = parse_segment_index(object) else {
                continue;
            };
            let data = self.storage.read(object).await?;
            let key = segment_key(&segment_id(chapter_id, bitrate, index));
            match self
                .cache
                .put(&key, &data, SEGMENT_MIME, self.options.cache_ttl_secs)
                .await
            {
                Ok(()) => loaded += 1,
                Err(err) => warn!(%key, %err, "preload cache write failed"),
            }
        }

        debug!(%chapter_id, bitrate, loaded, "preload finished");
        Ok(loaded)
    }

    pub fn analytics(&self, chapter_id: Option<String>) -> AnalyticsReport {
        AnalyticsReport {
            chapter_id,
            cache: self.cache.stats(),
        }
    }

    async fn completed_rendition(
        &self,
        chapter_id: &str,
        bitrate: u32,
    ) -> Result<crate::domain::model::Rendition> {
        match self.renditions.get(chapter_id, bitrate).await? {
            Some(rendition) if rendition.status == JobStatus::Completed => Ok(rendition),
            _ => Err(Error::RenditionUnavailable {
                chapter_id: chapter_id.to_string(),
                bitrate,
            }),
        }
    }

    async fn cache_get(&self, key: &str) -> Option<Bytes> {
        match self.cache.get(key).await {
            Ok(Some(payload)) => Some(payload.data),
            Ok(None) => None,
            Err(err) => {
                warn!(%key, %err, "cache read failed, falling through to storage");
                None
            }
        }
    }

    async fn cache_put(&self, key: &str, data: &[u8], content_type: &str) {
        if let Err(err) = self
            .cache
            .put(key, data, content_type, self.options.cache_ttl_secs)
            .await
        {
            warn!(%key, %err, "cache write failed");
        }
    }
}

/// Pick the variant to annotate: an available preferred bitrate wins, then
/// the best fit under the client's bandwidth, then the median.
fn select_recommended(
    available: &[u32],
    client_bandwidth: Option<u64>,
    preferred_bitrate: Option<u32>,
) -> u32 {
    if let Some(preferred) = preferred_bitrate {
        if available.contains(&preferred) {
            return preferred;
        }
    }

    let mut sorted = available.to_vec();
    sorted.sort_unstable();

    if let Some(bandwidth) = client_bandwidth {
        return sorted
            .iter()
            .rev()
            .find(|&&b| b as u64 * 1000 <= bandwidth)
            .copied()
            .unwrap_or_else(|| sorted.first().copied().unwrap_or(DEFAULT_BITRATE));
    }

    sorted
        .get(sorted.len() / 2)
        .copied()
        .unwrap_or(DEFAULT_BITRATE)
}

//! Deletion worker: purges a chapter's rendition rows, storage artifacts,
//! and cache entries.

use crate::domain::hls::{segment_id, parse_segment_index};
use crate::domain::jobs::{chapter_prefix, ChapterDeletion};
use crate::error::Result;
use crate::ports::cache::{playlist_key, segment_key, StreamCachePort};
use crate::ports::queue::{reconnect_delay, DeletionQueuePort};
use crate::ports::repository::RenditionRepository;
use crate::ports::storage::StoragePort;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct DeletionWorker<D, R> {
    storage: Arc<dyn StoragePort>,
    cache: Arc<dyn StreamCachePort>,
    queue: Arc<D>,
    renditions: Arc<R>,
}

impl<D, R> DeletionWorker<D, R>
where
    D: DeletionQueuePort,
    R: RenditionRepository,
{
    pub fn new(
        storage: Arc<dyn StoragePort>,
        cache: Arc<dyn StreamCachePort>,
        queue: Arc<D>,
        renditions: Arc<R>,
    ) -> Self {
        Self {
            storage,
            cache,
            queue,
            renditions,
        }
    }

    /// Consumer loop, concurrency 1, nack-with-requeue on failure.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("deletion worker started");
        let mut broker_failures = 0u32;
        loop {
            let consumed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.queue.consume(1.0) => result,
            };
            match consumed {
                Ok(Some(deletion)) => {
                    broker_failures = 0;
                    if let Err(err) = self.process(&deletion).await {
                        warn!(chapter_id = %deletion.chapter_id, %err,
                            "chapter purge failed, requeueing");
                        if let Err(err) = self.queue.requeue(&deletion).await {
                            warn!(chapter_id = %deletion.chapter_id, %err, "requeue failed");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                Ok(None) => {
                    broker_failures = 0;
                }
                Err(err) => {
                    let delay = reconnect_delay(broker_failures);
                    broker_failures += 1;
                    warn!(%err, ?delay, "deletion consume failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!("deletion worker stopped");
    }

    pub async fn process(&self, deletion: &ChapterDeletion) -> Result<()> {
        let chapter_id = &deletion.chapter_id;

        // Cache entries first, while the rendition rows still tell us which
        // playlist keys exist.
        let bitrates = self.renditions.completed_bitrates(chapter_id).await?;
        self.drop_cache(chapter_id, &bitrates).await;

        let keys = self.storage.list(&chapter_prefix(chapter_id)).await?;
        for key in &keys {
            if let Some(cache_key) = segment_cache_key(chapter_id, key) {
                if let Err(err) = self.cache.delete(&cache_key).await {
                    warn!(%cache_key, %err, "failed to drop cached segment");
                }
            }
            self.storage.delete(key).await?;
        }

        let rows = self.renditions.delete_for_chapter(chapter_id).await?;
        info!(%chapter_id, artifacts = keys.len(), rows, "chapter purged");
        Ok(())
    }

    async fn drop_cache(&self, chapter_id: &str, bitrates: &[u32]) {
        let mut keys = vec![playlist_key(chapter_id, "master")];
        keys.extend(
            bitrates
                .iter()
                .map(|b| playlist_key(chapter_id, &b.to_string())),
        );
        for key in keys {
            if let Err(err) = self.cache.delete(&key).await {
                warn!(%key, %err, "failed to drop cached playlist");
            }
        }
    }
}

/// Cache key of the segment stored at `key`, if `key` names one.
/// `bit_transcode/{chapter}/{bitrate}k/segment_NNN.ts` maps to
/// `stream:segment:{chapter}_{bitrate}_{NNN}`.
fn segment_cache_key(chapter_id: &str, key: &str) -> Option<String> {
    let mut parts = key.rsplit('/');
    let file = parts.next()?;
    if !file.starts_with("segment_") || !file.ends_with(".ts") {
        return None;
    }
    let bitrate: u32 = parts.next()?.strip_suffix('k')?.parse().ok()?;
    let index = parse_segment_index(file)?;
    Some(segment_key(&segment_id(chapter_id, bitrate, index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::ports::cache::MockStreamCachePort;
    use crate::ports::queue::MockDeletionQueuePort;
    use crate::ports::repository::MockRenditionRepository;
    use crate::ports::storage::MockStoragePort;
    use chrono::Utc;

    #[test]
    fn segment_keys_map_to_cache_keys() {
        assert_eq!(
            segment_cache_key("ch-1", "bit_transcode/ch-1/128k/segment_004.ts"),
            Some("stream:segment:ch-1_128_004".to_string())
        );
        assert_eq!(
            segment_cache_key("ch-1", "bit_transcode/ch-1/128k/playlist.m3u8"),
            None
        );
        assert_eq!(segment_cache_key("ch-1", "bit_transcode/ch-1/master.m3u8"), None);
    }

    #[tokio::test]
    async fn purge_removes_artifacts_cache_and_rows() {
        let mut renditions = MockRenditionRepository::new();
        renditions
            .expect_completed_bitrates()
            .returning(|_| Ok(vec![64]));
        renditions
            .expect_delete_for_chapter()
            .times(1)
            .returning(|_| Ok(1));

        let mut storage = MockStoragePort::new();
        storage.expect_list().returning(|_| {
            Ok(vec![
                "bit_transcode/ch-1/64k/playlist.m3u8".into(),
                "bit_transcode/ch-1/64k/segment_000.ts".into(),
                "bit_transcode/ch-1/master.m3u8".into(),
            ])
        });
        storage.expect_delete().times(3).returning(|_| Ok(()));

        let mut cache = MockStreamCachePort::new();
        // master + 64k playlist keys, plus the one segment
        cache.expect_delete().times(3).returning(|_| Ok(()));

        let worker = DeletionWorker::new(
            Arc::new(storage),
            Arc::new(cache),
            Arc::new(MockDeletionQueuePort::new()),
            Arc::new(renditions),
        );
        worker
            .process(&ChapterDeletion {
                chapter_id: "ch-1".into(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_failures_do_not_abort_the_purge() {
        let mut renditions = MockRenditionRepository::new();
        renditions
            .expect_completed_bitrates()
            .returning(|_| Ok(vec![]));
        renditions
            .expect_delete_for_chapter()
            .times(1)
            .returning(|_| Ok(0));

        let mut storage = MockStoragePort::new();
        storage
            .expect_list()
            .returning(|_| Ok(vec!["bit_transcode/ch-1/64k/segment_000.ts".into()]));
        storage.expect_delete().times(1).returning(|_| Ok(()));

        let mut cache = MockStreamCachePort::new();
        cache.expect_delete().returning(|_| {
            Err(CacheError::Serialization(
                serde_json::from_str::<u8>("bad").unwrap_err(),
            ))
        });

        let worker = DeletionWorker::new(
            Arc::new(storage),
            Arc::new(cache),
            Arc::new(MockDeletionQueuePort::new()),
            Arc::new(renditions),
        );
        worker
            .process(&ChapterDeletion {
                chapter_id: "ch-1".into(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }
}

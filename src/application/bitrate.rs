//! Bitrate worker: one encoder pass per `(chapter, bitrate)` job.

use crate::config::AppEnv;
use crate::domain::hls::{PLAYLIST_MIME, SEGMENT_MIME};
use crate::domain::jobs::BitrateJob;
use crate::domain::model::{JobStatus, Rendition};
use crate::error::{Error, Result, StorageError};
use crate::ports::encoder::{EncodeSpec, EncoderPort};
use crate::ports::queue::{reconnect_delay, WorkEnvelope, WorkQueuePort};
use crate::ports::repository::{JobRepository, RenditionRepository};
use crate::ports::storage::StoragePort;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct BitrateWorker<W, J, R, E> {
    storage: Arc<dyn StoragePort>,
    work: Arc<W>,
    jobs: Arc<J>,
    renditions: Arc<R>,
    encoder: Arc<E>,
    env: AppEnv,
    storage_root: PathBuf,
    job_timeout: Duration,
    queue: String,
}

impl<W, J, R, E> BitrateWorker<W, J, R, E>
where
    W: WorkQueuePort + 'static,
    J: JobRepository + 'static,
    R: RenditionRepository + 'static,
    E: EncoderPort + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StoragePort>,
        work: Arc<W>,
        jobs: Arc<J>,
        renditions: Arc<R>,
        encoder: Arc<E>,
        env: AppEnv,
        storage_root: PathBuf,
        job_timeout: Duration,
        queue: String,
    ) -> Self {
        Self {
            storage,
            work,
            jobs,
            renditions,
            encoder,
            env,
            storage_root,
            job_timeout,
            queue,
        }
    }

    /// Consumer loop. Two of these run per bitrate queue.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        info!(queue = %self.queue, worker_id, "bitrate worker started");
        let mut broker_failures = 0u32;
        loop {
            let reserved = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.work.reserve(&self.queue, 1.0) => result,
            };
            let envelope = match reserved {
                Ok(Some(envelope)) => {
                    broker_failures = 0;
                    envelope
                }
                Ok(None) => {
                    broker_failures = 0;
                    continue;
                }
                Err(err) => {
                    let delay = reconnect_delay(broker_failures);
                    broker_failures += 1;
                    warn!(queue = %self.queue, worker_id, %err, ?delay, "reserve failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            let job: BitrateJob = match envelope.decode() {
                Ok(job) => job,
                Err(err) => {
                    error!(queue = %self.queue, job_id = %envelope.id, %err, "undecodable job buried");
                    let _ = self.work.bury(&self.queue, &envelope).await;
                    continue;
                }
            };

            // Dropping the processing future kills any in-flight encoder
            // subprocess, so an interrupted job can go straight back on the
            // queue.
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(job_id = %envelope.id, "shutdown during processing, requeueing");
                    if let Err(err) = self.work.requeue(&self.queue, &envelope).await {
                        error!(job_id = %envelope.id, %err, "failed to requeue on shutdown");
                    }
                    break;
                }
                result = self.process(&job) => self.settle(&envelope, &job, result).await,
            }
        }
        info!(queue = %self.queue, worker_id, "bitrate worker stopped");
    }

    async fn settle(&self, envelope: &WorkEnvelope, job: &BitrateJob, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Err(err) = self.work.ack(&self.queue, envelope).await {
                    error!(job_id = %envelope.id, %err, "ack failed");
                }
            }
            Err(err) => {
                warn!(job_id = %envelope.id, attempt = envelope.attempt, %err, "bitrate job failed");
                self.mark_failed(job, &err).await;
                let outcome = if err.is_retriable() {
                    self.work.retry(&self.queue, envelope).await.map(|_| ())
                } else {
                    self.work.bury(&self.queue, envelope).await
                };
                if let Err(err) = outcome {
                    error!(job_id = %envelope.id, %err, "failed to settle job");
                }
            }
        }
    }

    pub async fn process(&self, job: &BitrateJob) -> Result<()> {
        self.report(&job.chapter_id, JobStatus::Processing, 10).await;

        // A completed rendition means an earlier delivery already did the
        // work; at-least-once delivery makes this a normal path.
        if let Some(existing) = self.renditions.get(&job.chapter_id, job.bitrate).await? {
            if existing.status == JobStatus::Completed {
                debug!(chapter_id = %job.chapter_id, bitrate = job.bitrate,
                    "rendition already completed, skipping encode");
                self.progress(&job.chapter_id, 100).await;
                return Ok(());
            }
        }

        let staged = self.stage_input(job).await?;
        let result = self.encode_and_publish(job, &staged).await;
        self.cleanup_staged(&staged).await;
        result?;

        self.renditions
            .upsert(&Rendition::completed(
                &job.chapter_id,
                job.bitrate,
                self.storage
                    .url(&format!("{}/playlist.m3u8", job.rendition_prefix())),
                job.rendition_prefix(),
                self.storage.provider(),
            ))
            .await?;
        self.progress(&job.chapter_id, 90).await;

        info!(chapter_id = %job.chapter_id, bitrate = job.bitrate, "rendition completed");
        Ok(())
    }

    /// Materialize the source object at a local staging path.
    async fn stage_input(&self, job: &BitrateJob) -> Result<PathBuf> {
        let key = &job.input_path;

        if self.env.is_development() {
            // Keep a browsable mirror of the source under the storage root.
            let mirror = self.storage_root.join(key);
            self.storage
                .download(key, &mirror)
                .await
                .map_err(|err| missing_or(err, key))?;
        } else if !self.storage.exists(key).await? {
            return Err(Error::InputMissing(key.clone()));
        }

        let basename = Path::new(key)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("input"));
        let staged = self
            .storage_root
            .join("temp")
            .join(format!("temp_{}_{}", Utc::now().timestamp_millis(), basename));
        self.storage
            .download(key, &staged)
            .await
            .map_err(|err| missing_or(err, key))?;
        Ok(staged)
    }

    async fn encode_and_publish(&self, job: &BitrateJob, staged: &Path) -> Result<()> {
        let local_provider = self.storage.provider() == "local";
        let out_dir = if local_provider {
            // The rendition directory is the destination itself.
            self.storage_root.join(job.rendition_prefix())
        } else {
            self.storage_root.join("temp").join(format!(
                "out_{}_{}k",
                job.chapter_id, job.bitrate
            ))
        };

        let (tx, mut rx) = mpsc::channel(16);
        let progress_task = {
            let jobs = self.jobs.clone();
            let chapter_id = job.chapter_id.clone();
            tokio::spawn(async move {
                while let Some(percent) = rx.recv().await {
                    // Encoder progress occupies the 10..90 band of the row.
                    let scaled = 10 + (percent as i64 * 80) / 100;
                    if let Ok(Some(row)) = jobs.latest_for_chapter(&chapter_id).await {
                        let _ = jobs.update_progress(&row.id, scaled).await;
                    }
                }
            })
        };

        let spec = EncodeSpec {
            input: staged.to_path_buf(),
            output_dir: out_dir.clone(),
            bitrate_kbps: job.bitrate,
            segment_duration: job.segment_duration,
        };
        let encode_result = self.encoder.transcode_hls(&spec, self.job_timeout, tx).await;
        progress_task.abort();
        encode_result?;

        if !local_provider {
            self.upload_rendition(job, &out_dir).await?;
            if let Err(err) = tokio::fs::remove_dir_all(&out_dir).await {
                warn!(dir = %out_dir.display(), %err, "failed to remove encoder output dir");
            }
        }
        Ok(())
    }

    /// Push playlist and segments to remote storage.
    async fn upload_rendition(&self, job: &BitrateJob, out_dir: &Path) -> Result<()> {
        let prefix = job.rendition_prefix();
        let mut entries = tokio::fs::read_dir(out_dir)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: out_dir.to_path_buf(),
            })?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: out_dir.to_path_buf(),
            })?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            let content_type = if name.ends_with(".m3u8") {
                PLAYLIST_MIME
            } else if name.ends_with(".ts") {
                SEGMENT_MIME
            } else {
                continue;
            };
            self.storage
                .upload(&path, &format!("{}/{}", prefix, name), content_type)
                .await?;
        }
        Ok(())
    }

    async fn cleanup_staged(&self, staged: &Path) {
        if let Err(err) = tokio::fs::remove_file(staged).await {
            debug!(path = %staged.display(), %err, "staged input already gone");
        }
        // Drop the temp dir once it is empty.
        if let Some(parent) = staged.parent() {
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    async fn mark_failed(&self, job: &BitrateJob, err: &Error) {
        let message = format!("{}k transcoding failed: {}", job.bitrate, err);
        match self.jobs.latest_for_chapter(&job.chapter_id).await {
            Ok(Some(row)) => {
                if let Err(err) = self
                    .jobs
                    .update_status(&row.id, JobStatus::Failed, Some(&message))
                    .await
                {
                    error!(chapter_id = %job.chapter_id, %err, "failed to record job failure");
                }
            }
            Ok(None) => {}
            Err(err) => error!(chapter_id = %job.chapter_id, %err, "failed to load job row"),
        }
    }

    async fn report(&self, chapter_id: &str, status: JobStatus, progress: i64) {
        match self.jobs.latest_for_chapter(chapter_id).await {
            Ok(Some(row)) => {
                if row.status != status {
                    let _ = self.jobs.update_status(&row.id, status, None).await;
                }
                let _ = self.jobs.update_progress(&row.id, progress).await;
            }
            Ok(None) => {}
            Err(err) => warn!(%chapter_id, %err, "failed to load job row for progress"),
        }
    }

    async fn progress(&self, chapter_id: &str, progress: i64) {
        if let Ok(Some(row)) = self.jobs.latest_for_chapter(chapter_id).await {
            let _ = self.jobs.update_progress(&row.id, progress).await;
        }
    }
}

fn missing_or(err: StorageError, key: &str) -> Error {
    match err {
        StorageError::NotFound(_) => Error::InputMissing(key.to_string()),
        other => Error::Storage(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::TranscodingJob;
    use crate::ports::encoder::MockEncoderPort;
    use crate::ports::queue::MockWorkQueuePort;
    use crate::ports::repository::{MockJobRepository, MockRenditionRepository};
    use crate::ports::storage::MockStoragePort;

    fn job() -> BitrateJob {
        BitrateJob {
            chapter_id: "ch-1".into(),
            input_path: "uploads/ch-1.mp3".into(),
            output_dir: "bit_transcode/ch-1".into(),
            bitrate: 128,
            segment_duration: 10,
            user_id: None,
        }
    }

    fn jobs_with_row() -> MockJobRepository {
        let mut jobs = MockJobRepository::new();
        let row = TranscodingJob::new("ch-1");
        jobs.expect_latest_for_chapter()
            .returning(move |_| Ok(Some(row.clone())));
        jobs.expect_update_progress().returning(|_, _| Ok(()));
        jobs.expect_update_status().returning(|_, _, _| Ok(()));
        jobs
    }

    fn worker(
        storage: MockStoragePort,
        jobs: MockJobRepository,
        renditions: MockRenditionRepository,
        encoder: MockEncoderPort,
        env: AppEnv,
        root: PathBuf,
    ) -> BitrateWorker<MockWorkQueuePort, MockJobRepository, MockRenditionRepository, MockEncoderPort>
    {
        BitrateWorker::new(
            Arc::new(storage),
            Arc::new(MockWorkQueuePort::new()),
            Arc::new(jobs),
            Arc::new(renditions),
            Arc::new(encoder),
            env,
            root,
            Duration::from_secs(3600),
            "transcode:128k".into(),
        )
    }

    #[tokio::test]
    async fn completed_rendition_short_circuits() {
        let mut renditions = MockRenditionRepository::new();
        renditions.expect_get().returning(|chapter, bitrate| {
            Ok(Some(Rendition::completed(
                chapter,
                bitrate,
                "url".into(),
                "path".into(),
                "local",
            )))
        });
        renditions.expect_upsert().times(0);

        let mut encoder = MockEncoderPort::new();
        encoder.expect_transcode_hls().times(0);

        let w = worker(
            MockStoragePort::new(),
            jobs_with_row(),
            renditions,
            encoder,
            AppEnv::Production,
            PathBuf::from("/tmp/callas-test"),
        );
        w.process(&job()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_input_is_deterministic_failure() {
        let mut renditions = MockRenditionRepository::new();
        renditions.expect_get().returning(|_, _| Ok(None));
        renditions.expect_upsert().times(0);

        let mut storage = MockStoragePort::new();
        storage.expect_exists().returning(|_| Ok(false));

        let mut encoder = MockEncoderPort::new();
        encoder.expect_transcode_hls().times(0);

        let w = worker(
            storage,
            jobs_with_row(),
            renditions,
            encoder,
            AppEnv::Production,
            PathBuf::from("/tmp/callas-test"),
        );
        match w.process(&job()).await {
            Err(Error::InputMissing(key)) => assert_eq!(key, "uploads/ch-1.mp3"),
            other => panic!("expected InputMissing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_provider_skips_upload_and_upserts_completed() {
        let mut renditions = MockRenditionRepository::new();
        renditions.expect_get().returning(|_, _| Ok(None));
        renditions
            .expect_upsert()
            .withf(|rendition| {
                rendition.chapter_id == "ch-1"
                    && rendition.bitrate == 128
                    && rendition.status == JobStatus::Completed
                    && rendition.segments_path == "bit_transcode/ch-1/128k"
                    && rendition.storage_provider == "local"
            })
            .times(1)
            .returning(|_| Ok(()));

        let mut storage = MockStoragePort::new();
        storage.expect_exists().returning(|_| Ok(true));
        storage.expect_download().returning(|_, _| Ok(()));
        storage.expect_provider().return_const("local");
        storage
            .expect_url()
            .returning(|key| format!("storage/{}", key));
        storage.expect_upload().times(0);

        let mut encoder = MockEncoderPort::new();
        encoder
            .expect_transcode_hls()
            .withf(|spec, _, _| {
                spec.bitrate_kbps == 128
                    && spec.segment_duration == 10
                    && spec.output_dir.ends_with("bit_transcode/ch-1/128k")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let w = worker(
            storage,
            jobs_with_row(),
            renditions,
            encoder,
            AppEnv::Production,
            std::env::temp_dir().join("callas-bitrate-test"),
        );
        w.process(&job()).await.unwrap();
    }

    #[tokio::test]
    async fn encoder_failure_propagates_as_retriable() {
        let mut renditions = MockRenditionRepository::new();
        renditions.expect_get().returning(|_, _| Ok(None));
        renditions.expect_upsert().times(0);

        let mut storage = MockStoragePort::new();
        storage.expect_exists().returning(|_| Ok(true));
        storage.expect_download().returning(|_, _| Ok(()));
        storage.expect_provider().return_const("local");

        let mut encoder = MockEncoderPort::new();
        encoder.expect_transcode_hls().returning(|_, _, _| {
            Err(crate::error::EncoderError::Failed {
                status: "exit status: 1".into(),
                stderr: "boom".into(),
            })
        });

        let w = worker(
            storage,
            jobs_with_row(),
            renditions,
            encoder,
            AppEnv::Production,
            std::env::temp_dir().join("callas-bitrate-test"),
        );
        let err = w.process(&job()).await.unwrap_err();
        assert!(err.is_retriable());
    }
}

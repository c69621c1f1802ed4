//! Master worker: the fan-in step that publishes a chapter's master
//! playlist once at least one rendition has completed.

use crate::domain::hls::{MasterPlaylist, PLAYLIST_MIME};
use crate::domain::jobs::MasterJob;
use crate::domain::model::JobStatus;
use crate::error::{Error, Result};
use crate::ports::queue::{reconnect_delay, WorkEnvelope, WorkQueuePort};
use crate::ports::repository::{JobRepository, RenditionRepository};
use crate::ports::storage::StoragePort;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct MasterWorker<W, J, R> {
    storage: Arc<dyn StoragePort>,
    work: Arc<W>,
    jobs: Arc<J>,
    renditions: Arc<R>,
    poll_interval: Duration,
    deadline: Duration,
    queue: String,
}

impl<W, J, R> MasterWorker<W, J, R>
where
    W: WorkQueuePort + 'static,
    J: JobRepository + 'static,
    R: RenditionRepository + 'static,
{
    pub fn new(
        storage: Arc<dyn StoragePort>,
        work: Arc<W>,
        jobs: Arc<J>,
        renditions: Arc<R>,
        queue: String,
    ) -> Self {
        Self {
            storage,
            work,
            jobs,
            renditions,
            poll_interval: Duration::from_secs(5),
            deadline: Duration::from_secs(30 * 60),
            queue,
        }
    }

    pub fn with_timing(mut self, poll_interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.deadline = deadline;
        self
    }

    /// Consumer loop, concurrency 1.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(queue = %self.queue, "master worker started");
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
                    warn!(queue = %self.queue, %err, ?delay, "reserve failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            let job: MasterJob = match envelope.decode() {
                Ok(job) => job,
                Err(err) => {
                    error!(job_id = %envelope.id, %err, "undecodable master job buried");
                    let _ = self.work.bury(&self.queue, &envelope).await;
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = self.work.requeue(&self.queue, &envelope).await {
                        error!(job_id = %envelope.id, %err, "failed to requeue on shutdown");
                    }
                    break;
                }
                result = self.process(&job) => self.settle(&envelope, &job, result).await,
            }
        }
        info!(queue = %self.queue, "master worker stopped");
    }

    async fn settle(&self, envelope: &WorkEnvelope, job: &MasterJob, result: Result<()>) {
        match result {
            Ok(()) => {
                if let Err(err) = self.work.ack(&self.queue, envelope).await {
                    error!(job_id = %envelope.id, %err, "ack failed");
                }
            }
            Err(err) => {
                warn!(job_id = %envelope.id, %err, "master job failed");
                self.mark_failed(&job.chapter_id, &err).await;
                let outcome = match err {
                    // No rendition ever arrived; retrying just repeats the
                    // 30-minute wait against a chapter that failed to encode.
                    Error::MasterDeadline(_) => self.work.bury(&self.queue, envelope).await,
                    _ => self.work.retry(&self.queue, envelope).await.map(|_| ()),
                };
                if let Err(err) = outcome {
                    error!(job_id = %envelope.id, %err, "failed to settle master job");
                }
            }
        }
    }

    pub async fn process(&self, job: &MasterJob) -> Result<()> {
        self.progress(&job.chapter_id, 10).await;

        // Partial success is the contract: publish as soon as one rendition
        // exists rather than holding the chapter hostage to its slowest
        // bitrate.
        let ready = self.wait_for_renditions(job).await?;
        self.progress(&job.chapter_id, 30).await;

        let body = MasterPlaylist::new(ready.clone()).render();
        self.storage
            .upload_bytes(body.as_bytes(), &job.master_key(), PLAYLIST_MIME)
            .await?;

        self.complete(&job.chapter_id).await;
        info!(chapter_id = %job.chapter_id, bitrates = ?ready, "master playlist published");
        Ok(())
    }

    async fn wait_for_renditions(&self, job: &MasterJob) -> Result<Vec<u32>> {
        let started = Instant::now();
        loop {
            let completed = self
                .renditions
                .completed_bitrates(&job.chapter_id)
                .await?
                .into_iter()
                .filter(|b| job.variant_bitrates.contains(b))
                .collect::<Vec<_>>();
            if !completed.is_empty() {
                return Ok(completed);
            }
            if started.elapsed() >= self.deadline {
                return Err(Error::MasterDeadline(job.chapter_id.clone()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn progress(&self, chapter_id: &str, progress: i64) {
        if let Ok(Some(row)) = self.jobs.latest_for_chapter(chapter_id).await {
            let _ = self.jobs.update_progress(&row.id, progress).await;
        }
    }

    /// Completion flows through the job row only while it is still
    /// processing; a row a bitrate worker failed stays failed.
    async fn complete(&self, chapter_id: &str) {
        match self.jobs.latest_for_chapter(chapter_id).await {
            Ok(Some(row)) if row.status == JobStatus::Processing => {
                if let Err(err) = self
                    .jobs
                    .update_status(&row.id, JobStatus::Completed, None)
                    .await
                {
                    error!(%chapter_id, %err, "failed to complete job row");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%chapter_id, %err, "failed to load job row"),
        }
    }

    async fn mark_failed(&self, chapter_id: &str, err: &Error) {
        let message = format!("master playlist assembly failed: {}", err);
        match self.jobs.latest_for_chapter(chapter_id).await {
            Ok(Some(row)) => {
                if let Err(err) = self
                    .jobs
                    .update_status(&row.id, JobStatus::Failed, Some(&message))
                    .await
                {
                    error!(%chapter_id, %err, "failed to record master failure");
                }
            }
            Ok(None) => {}
            Err(err) => error!(%chapter_id, %err, "failed to load job row"),
        }
    }
}

//! Intake worker: decomposes a chapter transcode request into per-bitrate
//! jobs plus one master-assembly job.

use crate::domain::jobs::{
    bitrate_queue, chapter_prefix, BitrateJob, MasterJob, Priority, TranscodeRequest, MASTER_QUEUE,
};
use crate::domain::model::{JobStatus, TranscodingJob};
use crate::error::Result;
use crate::ports::queue::{reconnect_delay, IntakeDelivery, IntakeQueuePort, WorkQueuePort};
use crate::ports::repository::{JobRepository, RenditionRepository};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Delivery attempts on the intake routes before escalation kicks in.
const INTAKE_MAX_DELIVERIES: u32 = 3;

/// Ceiling on cross-route escalations carried in `retry_count`.
const MAX_ESCALATIONS: u32 = 3;

/// Delay before the master fan-in job becomes visible.
const MASTER_START_DELAY: Duration = Duration::from_secs(5);

pub struct IntakeService<I, W, J, R> {
    intake: Arc<I>,
    work: Arc<W>,
    jobs: Arc<J>,
    renditions: Arc<R>,
    segment_duration: u32,
}

impl<I, W, J, R> IntakeService<I, W, J, R>
where
    I: IntakeQueuePort,
    W: WorkQueuePort,
    J: JobRepository,
    R: RenditionRepository,
{
    pub fn new(
        intake: Arc<I>,
        work: Arc<W>,
        jobs: Arc<J>,
        renditions: Arc<R>,
        segment_duration: u32,
    ) -> Self {
        Self {
            intake,
            work,
            jobs,
            renditions,
            segment_duration,
        }
    }

    /// Fan a request out into bitrate jobs. Returns how many bitrate jobs
    /// were enqueued; zero means everything was already transcoded.
    pub async fn handle(&self, request: &TranscodeRequest) -> Result<usize> {
        let chapter_id = &request.chapter.id;
        let done = self.renditions.completed_bitrates(chapter_id).await?;
        let todo: Vec<u32> = request
            .bitrates
            .iter()
            .copied()
            .filter(|b| !done.contains(b))
            .collect();

        if todo.is_empty() {
            info!(%chapter_id, "all requested bitrates already completed, nothing to do");
            return Ok(0);
        }

        let job = TranscodingJob::new(chapter_id);
        self.jobs.create(&job).await?;

        let now = Utc::now();
        let priority = request.priority.weight();
        let output_dir = chapter_prefix(chapter_id);

        for &bitrate in &todo {
            let bitrate_job = BitrateJob {
                chapter_id: chapter_id.clone(),
                input_path: request.chapter.file_path.clone(),
                output_dir: output_dir.clone(),
                bitrate,
                segment_duration: self.segment_duration,
                user_id: request.user_id.clone(),
            };
            self.work
                .enqueue(
                    &bitrate_queue(bitrate),
                    &bitrate_job.job_id(now),
                    serde_json::to_value(&bitrate_job)
                        .map_err(crate::error::QueueError::from)?,
                    priority,
                    Duration::ZERO,
                )
                .await?;
        }

        let master = MasterJob {
            chapter_id: chapter_id.clone(),
            output_dir,
            variant_bitrates: todo.clone(),
        };
        self.work
            .enqueue(
                MASTER_QUEUE,
                &format!("{}-master-{}", chapter_id, now.timestamp_millis()),
                serde_json::to_value(&master).map_err(crate::error::QueueError::from)?,
                priority,
                MASTER_START_DELAY,
            )
            .await?;

        info!(%chapter_id, bitrates = ?todo, "dispatched transcode jobs");
        Ok(todo.len())
    }

    /// Apply the retry policy around one delivery: requeue while delivery
    /// attempts remain, then mark the job failed and escalate once per
    /// `retry_count` to the low-priority route.
    pub async fn handle_delivery(&self, delivery: IntakeDelivery) {
        let chapter_id = delivery.request.chapter.id.clone();
        let err = match self.handle(&delivery.request).await {
            Ok(_) => return,
            Err(err) => err,
        };
        warn!(%chapter_id, attempts = delivery.attempts, %err, "intake handling failed");

        if delivery.attempts + 1 < INTAKE_MAX_DELIVERIES {
            if let Err(err) = self.intake.requeue(&delivery).await {
                error!(%chapter_id, %err, "failed to requeue intake message");
            }
            return;
        }

        self.mark_latest_failed(&chapter_id, &err.to_string()).await;

        if delivery.request.retry_count < MAX_ESCALATIONS {
            let mut escalated = delivery.request.clone();
            escalated.retry_count += 1;
            escalated.priority = Priority::Low;
            match self.intake.publish(&escalated, Priority::Low).await {
                Ok(()) => {
                    info!(%chapter_id, retry_count = escalated.retry_count,
                        "escalated intake message to the low-priority route")
                }
                Err(err) => error!(%chapter_id, %err, "failed to escalate intake message"),
            }
        } else {
            error!(%chapter_id, retry_count = delivery.request.retry_count,
                "dropping intake message, escalations exhausted");
        }
    }

    async fn mark_latest_failed(&self, chapter_id: &str, message: &str) {
        match self.jobs.latest_for_chapter(chapter_id).await {
            Ok(Some(job)) => {
                if let Err(err) = self
                    .jobs
                    .update_status(&job.id, JobStatus::Failed, Some(message))
                    .await
                {
                    error!(%chapter_id, %err, "failed to mark job failed");
                }
            }
            Ok(None) => {}
            Err(err) => error!(%chapter_id, %err, "failed to look up job row"),
        }
    }

    /// Consumer loop; several run concurrently against the same routes.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "intake worker started");
        let mut broker_failures = 0u32;
        loop {
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.intake.consume(1.0) => result,
            };
            match delivery {
                Ok(Some(delivery)) => {
                    broker_failures = 0;
                    self.handle_delivery(delivery).await;
                }
                Ok(None) => {
                    broker_failures = 0;
                }
                Err(err) => {
                    let delay = reconnect_delay(broker_failures);
                    broker_failures += 1;
                    warn!(worker_id, %err, ?delay, "intake consume failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!(worker_id, "intake worker stopped");
    }
}

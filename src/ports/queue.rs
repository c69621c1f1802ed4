use crate::domain::jobs::{ChapterDeletion, Priority, TranscodeRequest};
use crate::error::QueueError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

/// A delivered intake message together with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeDelivery {
    pub message_id: String,
    /// Prior failed deliveries of this message
    pub attempts: u32,
    pub request: TranscodeRequest,
}

/// Priority-routed intake bus for chapter transcode requests. Messages carry
/// a per-route TTL; expired messages are dropped at consumption.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IntakeQueuePort: Send + Sync {
    async fn publish(&self, request: &TranscodeRequest, priority: Priority)
        -> Result<(), QueueError>;

    /// Pop the next live message, preferring higher-priority routes.
    /// `timeout_secs`: 0.0 blocks indefinitely.
    async fn consume(&self, timeout_secs: f64) -> Result<Option<IntakeDelivery>, QueueError>;

    /// Put a failed delivery back on its route with the attempt recorded.
    async fn requeue(&self, delivery: &IntakeDelivery) -> Result<(), QueueError>;
}

/// Envelope stored on a work queue. The payload stays JSON until the worker
/// that owns the queue decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkEnvelope {
    pub id: String,
    pub payload: serde_json::Value,
    pub priority: u8,
    /// Failed deliveries so far
    pub attempt: u32,
}

impl WorkEnvelope {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// What happened to a job handed back after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Re-enters the queue after the given backoff
    Retried { delay_secs: u64 },
    /// Attempts exhausted; moved to the dead-letter list
    Buried,
}

/// Durable work queue with per-job priority, optional start delay, and
/// exponential-backoff retry. One logical queue per bitrate plus one for
/// master assembly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkQueuePort: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        id: &str,
        payload: serde_json::Value,
        priority: u8,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Reserve the next ready job. The envelope stays on the active list
    /// until `ack`, `retry`, or `requeue` settles it.
    async fn reserve(
        &self,
        queue: &str,
        timeout_secs: f64,
    ) -> Result<Option<WorkEnvelope>, QueueError>;

    async fn ack(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError>;

    /// Schedule another attempt with backoff, or bury when attempts are
    /// exhausted.
    async fn retry(
        &self,
        queue: &str,
        envelope: &WorkEnvelope,
    ) -> Result<RetryDisposition, QueueError>;

    /// Deterministic failure: settle the job on the dead-letter list now.
    async fn bury(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError>;

    /// Put an interrupted job straight back on the ready list without
    /// counting an attempt (shutdown path).
    async fn requeue(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError>;

    /// Move jobs stranded on the active list by a crashed worker back to
    /// ready. Called once at startup per queue.
    async fn recover(&self, queue: &str) -> Result<u64, QueueError>;
}

/// Delay before reconnect attempt `attempt` after a broker failure:
/// 5 s doubling per attempt, capped at ten doublings.
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_secs(5u64.saturating_mul(1 << attempt.min(10)))
}

/// Deletion notices, consumed with nack-requeue semantics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeletionQueuePort: Send + Sync {
    async fn publish(&self, deletion: &ChapterDeletion) -> Result<(), QueueError>;

    async fn consume(&self, timeout_secs: f64) -> Result<Option<ChapterDeletion>, QueueError>;

    /// Requeue after a transient failure.
    async fn requeue(&self, deletion: &ChapterDeletion) -> Result<(), QueueError>;
}

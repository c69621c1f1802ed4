//! Durable per-bitrate work queues.
//!
//! Each logical queue is a family of Redis keys:
//! - `{queue}:high` / `{queue}:normal` / `{queue}:low`: ready lists popped
//!   in priority order;
//! - `{queue}:delayed`: sorted set of envelopes scored by their not-before
//!   timestamp (start delays and retry backoff);
//! - `{queue}:active`: hash of reserved envelopes by job id, replayed on
//!   startup so a crashed worker's jobs are not lost;
//! - `{queue}:dead`: envelopes whose attempts are exhausted.

use crate::error::QueueError;
use crate::ports::queue::{RetryDisposition, WorkEnvelope, WorkQueuePort};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;

use super::pool::RedisPool;

/// Retry policy shared by every queue this adapter serves.
#[derive(Debug, Clone, Copy)]
pub struct WorkQueuePolicy {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
}

impl WorkQueuePolicy {
    /// Exponential backoff before attempt `attempt` (1-based).
    pub fn backoff_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base_secs.saturating_mul(1u64 << exponent)
    }
}

fn ready_key(queue: &str, priority: u8) -> String {
    let band = if priority >= 10 {
        "high"
    } else if priority >= 5 {
        "normal"
    } else {
        "low"
    };
    format!("{}:{}", queue, band)
}

fn ready_keys(queue: &str) -> [String; 3] {
    [
        format!("{}:high", queue),
        format!("{}:normal", queue),
        format!("{}:low", queue),
    ]
}

fn delayed_key(queue: &str) -> String {
    format!("{}:delayed", queue)
}

fn active_key(queue: &str) -> String {
    format!("{}:active", queue)
}

fn dead_key(queue: &str) -> String {
    format!("{}:dead", queue)
}

pub struct RedisWorkQueue {
    pool: RedisPool,
    policy: WorkQueuePolicy,
}

impl RedisWorkQueue {
    pub fn new(pool: RedisPool, policy: WorkQueuePolicy) -> Self {
        Self { pool, policy }
    }

    async fn push_ready(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError> {
        let mut conn = self.pool.pool.get().await?;
        let json = serde_json::to_string(envelope)?;
        conn.lpush::<_, _, ()>(ready_key(queue, envelope.priority), json)
            .await?;
        Ok(())
    }

    async fn push_delayed(
        &self,
        queue: &str,
        envelope: &WorkEnvelope,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.pool.pool.get().await?;
        let json = serde_json::to_string(envelope)?;
        let ready_at = Utc::now().timestamp() + delay.as_secs() as i64;
        conn.zadd::<_, _, _, ()>(delayed_key(queue), json, ready_at)
            .await?;
        Ok(())
    }

    /// Move due envelopes from the delayed set onto their ready lists.
    async fn promote_due(&self, queue: &str) -> Result<(), QueueError> {
        let now = Utc::now().timestamp();
        loop {
            let mut conn = self.pool.pool.get().await?;
            let popped: Vec<(String, f64)> = conn.zpopmin(delayed_key(queue), 1).await?;
            let Some((json, score)) = popped.into_iter().next() else {
                return Ok(());
            };
            if score as i64 > now {
                // Not due yet; put it back and stop scanning.
                conn.zadd::<_, _, _, ()>(delayed_key(queue), json, score)
                    .await?;
                return Ok(());
            }
            let envelope: WorkEnvelope = serde_json::from_str(&json)?;
            drop(conn);
            self.push_ready(queue, &envelope).await?;
        }
    }

    async fn settle(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError> {
        let mut conn = self.pool.pool.get().await?;
        conn.hdel::<_, _, ()>(active_key(queue), &envelope.id)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueuePort for RedisWorkQueue {
    async fn enqueue(
        &self,
        queue: &str,
        id: &str,
        payload: serde_json::Value,
        priority: u8,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let envelope = WorkEnvelope {
            id: id.to_string(),
            payload,
            priority,
            attempt: 0,
        };
        if delay.is_zero() {
            self.push_ready(queue, &envelope).await
        } else {
            self.push_delayed(queue, &envelope, delay).await
        }
    }

    async fn reserve(
        &self,
        queue: &str,
        timeout_secs: f64,
    ) -> Result<Option<WorkEnvelope>, QueueError> {
        self.promote_due(queue).await?;

        let mut conn = self.pool.pool.get().await?;
        let keys = ready_keys(queue);
        let popped: Option<(String, String)> = conn
            .brpop(&[&keys[0], &keys[1], &keys[2]], timeout_secs)
            .await?;
        let Some((_, json)) = popped else {
            return Ok(None);
        };
        let envelope: WorkEnvelope = serde_json::from_str(&json)?;
        conn.hset::<_, _, _, ()>(active_key(queue), &envelope.id, &json)
            .await?;
        Ok(Some(envelope))
    }

    async fn ack(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError> {
        self.settle(queue, envelope).await
    }

    async fn retry(
        &self,
        queue: &str,
        envelope: &WorkEnvelope,
    ) -> Result<RetryDisposition, QueueError> {
        self.settle(queue, envelope).await?;

        let attempt = envelope.attempt + 1;
        if attempt >= self.policy.max_attempts {
            let mut conn = self.pool.pool.get().await?;
            let json = serde_json::to_string(envelope)?;
            conn.lpush::<_, _, ()>(dead_key(queue), json).await?;
            return Ok(RetryDisposition::Buried);
        }

        let delay_secs = self.policy.backoff_secs(attempt);
        let retried = WorkEnvelope {
            attempt,
            ..envelope.clone()
        };
        self.push_delayed(queue, &retried, Duration::from_secs(delay_secs))
            .await?;
        debug!(job_id = %envelope.id, attempt, delay_secs, "job scheduled for retry");
        Ok(RetryDisposition::Retried { delay_secs })
    }

    async fn bury(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError> {
        self.settle(queue, envelope).await?;
        let mut conn = self.pool.pool.get().await?;
        let json = serde_json::to_string(envelope)?;
        conn.lpush::<_, _, ()>(dead_key(queue), json).await?;
        Ok(())
    }

    async fn requeue(&self, queue: &str, envelope: &WorkEnvelope) -> Result<(), QueueError> {
        self.settle(queue, envelope).await?;
        self.push_ready(queue, envelope).await
    }

    async fn recover(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.pool.pool.get().await?;
        let stranded: Vec<(String, String)> = conn.hgetall(active_key(queue)).await?;
        let count = stranded.len() as u64;
        conn.del::<_, ()>(active_key(queue)).await?;
        drop(conn);

        for (_, json) in stranded {
            let envelope: WorkEnvelope = serde_json::from_str(&json)?;
            self.push_ready(queue, &envelope).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = WorkQueuePolicy {
            max_attempts: 3,
            backoff_base_secs: 30,
        };
        assert_eq!(policy.backoff_secs(1), 30);
        assert_eq!(policy.backoff_secs(2), 60);
        assert_eq!(policy.backoff_secs(3), 120);
    }

    #[test]
    fn backoff_exponent_is_capped() {
        let policy = WorkQueuePolicy {
            max_attempts: 100,
            backoff_base_secs: 30,
        };
        assert_eq!(policy.backoff_secs(20), 30 * (1 << 16));
    }

    #[test]
    fn priority_bands() {
        assert_eq!(ready_key("transcode:64k", 10), "transcode:64k:high");
        assert_eq!(ready_key("transcode:64k", 5), "transcode:64k:normal");
        assert_eq!(ready_key("transcode:64k", 1), "transcode:64k:low");
    }

    #[test]
    fn envelope_decodes_typed_payload() {
        use crate::domain::jobs::MasterJob;

        let payload = serde_json::to_value(MasterJob {
            chapter_id: "ch-1".into(),
            output_dir: "bit_transcode/ch-1".into(),
            variant_bitrates: vec![64, 128],
        })
        .unwrap();
        let envelope = WorkEnvelope {
            id: "job-1".into(),
            payload,
            priority: 5,
            attempt: 0,
        };
        let job: MasterJob = envelope.decode().unwrap();
        assert_eq!(job.variant_bitrates, vec![64, 128]);
    }
}

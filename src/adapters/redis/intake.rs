//! Priority-routed intake bus and the deletion topic.
//!
//! Each routing key is one Redis list; consumption prefers the priority
//! route, then normal, then low, via a single multi-key BRPOP. Messages
//! carry their expiry so stale work is dropped at consumption time.

use crate::domain::jobs::{ChapterDeletion, Priority, TranscodeRequest, DELETION_TOPIC};
use crate::error::QueueError;
use crate::ports::queue::{DeletionQueuePort, IntakeDelivery, IntakeQueuePort};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pool::RedisPool;

const ROUTE_PRIORITY: &str = "audiobook.transcode.priority";
const ROUTE_NORMAL: &str = "audiobook.transcode.normal";
const ROUTE_LOW: &str = "audiobook.transcode.low";

fn route_key(priority: Priority) -> &'static str {
    match priority {
        Priority::High => ROUTE_PRIORITY,
        Priority::Normal => ROUTE_NORMAL,
        Priority::Low => ROUTE_LOW,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IntakeEnvelope {
    message_id: String,
    attempts: u32,
    enqueued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    request: TranscodeRequest,
}

pub struct RedisIntakeQueue {
    pool: RedisPool,
    /// TTL of the priority and normal routes; low gets twice this
    message_ttl_secs: u64,
}

impl RedisIntakeQueue {
    pub fn new(pool: RedisPool, message_ttl_secs: u64) -> Self {
        Self {
            pool,
            message_ttl_secs,
        }
    }

    fn route_ttl_secs(&self, priority: Priority) -> u64 {
        match priority {
            Priority::Low => self.message_ttl_secs * 2,
            _ => self.message_ttl_secs,
        }
    }

    async fn push(&self, envelope: &IntakeEnvelope, priority: Priority) -> Result<(), QueueError> {
        let mut conn = self.pool.pool.get().await?;
        let json = serde_json::to_string(envelope)?;
        conn.lpush::<_, _, ()>(route_key(priority), json).await?;
        Ok(())
    }
}

#[async_trait]
impl IntakeQueuePort for RedisIntakeQueue {
    async fn publish(
        &self,
        request: &TranscodeRequest,
        priority: Priority,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let envelope = IntakeEnvelope {
            message_id: request.message_id(),
            attempts: 0,
            enqueued_at: now,
            expires_at: now + chrono::Duration::seconds(self.route_ttl_secs(priority) as i64),
            request: request.clone(),
        };
        self.push(&envelope, priority).await
    }

    async fn consume(&self, timeout_secs: f64) -> Result<Option<IntakeDelivery>, QueueError> {
        let mut conn = self.pool.pool.get().await?;
        loop {
            // BRPOP prefers keys in argument order, which is exactly the
            // route precedence.
            let popped: Option<(String, String)> = conn
                .brpop(&[ROUTE_PRIORITY, ROUTE_NORMAL, ROUTE_LOW], timeout_secs)
                .await?;
            let Some((_, json)) = popped else {
                return Ok(None);
            };
            let envelope: IntakeEnvelope = serde_json::from_str(&json)?;
            if envelope.expires_at <= Utc::now() {
                debug!(message_id = %envelope.message_id, "dropping expired intake message");
                continue;
            }
            return Ok(Some(IntakeDelivery {
                message_id: envelope.message_id,
                attempts: envelope.attempts,
                request: envelope.request,
            }));
        }
    }

    async fn requeue(&self, delivery: &IntakeDelivery) -> Result<(), QueueError> {
        let priority = delivery.request.priority;
        let now = Utc::now();
        let envelope = IntakeEnvelope {
            message_id: delivery.message_id.clone(),
            attempts: delivery.attempts + 1,
            enqueued_at: now,
            expires_at: now + chrono::Duration::seconds(self.route_ttl_secs(priority) as i64),
            request: delivery.request.clone(),
        };
        self.push(&envelope, priority).await
    }
}

/// Deletion notices travel on their own topic list with the same
/// push/pop mechanics.
pub struct RedisDeletionQueue {
    pool: RedisPool,
}

impl RedisDeletionQueue {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeletionQueuePort for RedisDeletionQueue {
    async fn publish(&self, deletion: &ChapterDeletion) -> Result<(), QueueError> {
        let mut conn = self.pool.pool.get().await?;
        let json = serde_json::to_string(deletion)?;
        conn.lpush::<_, _, ()>(DELETION_TOPIC, json).await?;
        Ok(())
    }

    async fn consume(&self, timeout_secs: f64) -> Result<Option<ChapterDeletion>, QueueError> {
        let mut conn = self.pool.pool.get().await?;
        let popped: Option<(String, String)> = conn.brpop(DELETION_TOPIC, timeout_secs).await?;
        match popped {
            Some((_, json)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn requeue(&self, deletion: &ChapterDeletion) -> Result<(), QueueError> {
        self.publish(deletion).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_map_to_topology_names() {
        assert_eq!(route_key(Priority::High), "audiobook.transcode.priority");
        assert_eq!(route_key(Priority::Normal), "audiobook.transcode.normal");
        assert_eq!(route_key(Priority::Low), "audiobook.transcode.low");
    }

    #[test]
    fn low_route_ttl_is_doubled() {
        let queue = RedisIntakeQueue {
            pool: RedisPool::new("redis://127.0.0.1/").unwrap(),
            message_ttl_secs: 3600,
        };
        assert_eq!(queue.route_ttl_secs(Priority::High), 3600);
        assert_eq!(queue.route_ttl_secs(Priority::Normal), 3600);
        assert_eq!(queue.route_ttl_secs(Priority::Low), 7200);
    }
}

//! Rows of the relational state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a chapter-level transcoding job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Chapter-level bookkeeping row. The most recent row by `created_at` is the
/// authoritative one for a chapter.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscodingJob {
    pub id: String,
    pub chapter_id: String,
    pub status: JobStatus,
    pub progress: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TranscodingJob {
    pub fn new(chapter_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chapter_id: chapter_id.to_string(),
            status: JobStatus::Processing,
            progress: 0,
            started_at: Some(now),
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One completed (or in-flight) bitrate version of a chapter. Unique per
/// `(chapter_id, bitrate)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rendition {
    pub id: String,
    pub chapter_id: String,
    pub bitrate: i64,
    pub playlist_url: String,
    pub segments_path: String,
    pub storage_provider: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rendition {
    pub fn completed(
        chapter_id: &str,
        bitrate: u32,
        playlist_url: String,
        segments_path: String,
        storage_provider: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chapter_id: chapter_id.to_string(),
            bitrate: bitrate as i64,
            playlist_url,
            segments_path,
            storage_provider: storage_provider.to_string(),
            status: JobStatus::Completed,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_processing() {
        let job = TranscodingJob::new("ch-1");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}

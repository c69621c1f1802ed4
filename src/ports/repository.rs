use crate::domain::model::{JobStatus, Rendition, TranscodingJob};
use crate::error::RepoError;
use async_trait::async_trait;

/// Chapter-level job bookkeeping. The most recent row by `created_at` is
/// authoritative per chapter; older rows are history.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn create(&self, job: &TranscodingJob) -> Result<(), RepoError>;

    /// Update status and error message. Terminal states also set
    /// `completed_at`; `completed` forces progress to 100.
    async fn update_status<'a>(
        &self,
        job_id: &'a str,
        status: JobStatus,
        error_message: Option<&'a str>,
    ) -> Result<(), RepoError>;

    async fn update_progress(&self, job_id: &str, progress: i64) -> Result<(), RepoError>;

    async fn latest_for_chapter(
        &self,
        chapter_id: &str,
    ) -> Result<Option<TranscodingJob>, RepoError>;
}

/// Rendition rows, unique per `(chapter_id, bitrate)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RenditionRepository: Send + Sync {
    /// Insert or overwrite the row for the rendition's `(chapter_id, bitrate)`.
    async fn upsert(&self, rendition: &Rendition) -> Result<(), RepoError>;

    async fn get(&self, chapter_id: &str, bitrate: u32) -> Result<Option<Rendition>, RepoError>;

    /// Bitrates with a completed rendition, ascending.
    async fn completed_bitrates(&self, chapter_id: &str) -> Result<Vec<u32>, RepoError>;

    /// Remove every rendition row of a chapter; returns the count removed.
    async fn delete_for_chapter(&self, chapter_id: &str) -> Result<u64, RepoError>;
}

//! JobRepository over `transcoding_jobs`.

use crate::domain::model::{JobStatus, TranscodingJob};
use crate::error::RepoError;
use crate::ports::repository::JobRepository;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct SqlJobRepository {
    pool: SqlitePool,
}

impl SqlJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlJobRepository {
    async fn create(&self, job: &TranscodingJob) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO transcoding_jobs
                (id, chapter_id, status, progress, started_at, completed_at,
                 error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.chapter_id)
        .bind(job.status)
        .bind(job.progress)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status<'a>(
        &self,
        job_id: &'a str,
        status: JobStatus,
        error_message: Option<&'a str>,
    ) -> Result<(), RepoError> {
        let now = Utc::now();
        let completed_at = status.is_terminal().then_some(now);
        // `completed` implies progress 100; other transitions leave it alone.
        if status == JobStatus::Completed {
            sqlx::query(
                r#"
                UPDATE transcoding_jobs
                SET status = ?, progress = 100, error_message = ?,
                    completed_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(status)
            .bind(error_message)
            .bind(completed_at)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE transcoding_jobs
                SET status = ?, error_message = ?, completed_at = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(status)
            .bind(error_message)
            .bind(completed_at)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn update_progress(&self, job_id: &str, progress: i64) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            UPDATE transcoding_jobs
            SET progress = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(progress.clamp(0, 100))
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_for_chapter(
        &self,
        chapter_id: &str,
    ) -> Result<Option<TranscodingJob>, RepoError> {
        let job = sqlx::query_as::<_, TranscodingJob>(
            r#"
            SELECT id, chapter_id, status, progress, started_at, completed_at,
                   error_message, created_at, updated_at
            FROM transcoding_jobs
            WHERE chapter_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(chapter_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::db::memory_pool;

    #[tokio::test]
    async fn create_and_fetch_latest() {
        let repo = SqlJobRepository::new(memory_pool().await);
        let job = TranscodingJob::new("ch-1");
        repo.create(&job).await.unwrap();

        let latest = repo.latest_for_chapter("ch-1").await.unwrap().unwrap();
        assert_eq!(latest.id, job.id);
        assert_eq!(latest.status, JobStatus::Processing);
        assert_eq!(latest.progress, 0);
    }

    #[tokio::test]
    async fn latest_is_most_recent_by_created_at() {
        let repo = SqlJobRepository::new(memory_pool().await);
        let mut old = TranscodingJob::new("ch-1");
        old.created_at = old.created_at - chrono::Duration::seconds(60);
        repo.create(&old).await.unwrap();
        let recent = TranscodingJob::new("ch-1");
        repo.create(&recent).await.unwrap();

        let latest = repo.latest_for_chapter("ch-1").await.unwrap().unwrap();
        assert_eq!(latest.id, recent.id);
    }

    #[tokio::test]
    async fn completed_sets_progress_and_completed_at() {
        let repo = SqlJobRepository::new(memory_pool().await);
        let job = TranscodingJob::new("ch-1");
        repo.create(&job).await.unwrap();

        repo.update_status(&job.id, JobStatus::Completed, None)
            .await
            .unwrap();
        let latest = repo.latest_for_chapter("ch-1").await.unwrap().unwrap();
        assert_eq!(latest.status, JobStatus::Completed);
        assert_eq!(latest.progress, 100);
        assert!(latest.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_keeps_progress_but_records_error() {
        let repo = SqlJobRepository::new(memory_pool().await);
        let job = TranscodingJob::new("ch-1");
        repo.create(&job).await.unwrap();

        repo.update_progress(&job.id, 40).await.unwrap();
        repo.update_status(&job.id, JobStatus::Failed, Some("128k transcoding failed"))
            .await
            .unwrap();

        let latest = repo.latest_for_chapter("ch-1").await.unwrap().unwrap();
        assert_eq!(latest.status, JobStatus::Failed);
        assert_eq!(latest.progress, 40);
        assert!(latest.completed_at.is_some());
        assert_eq!(
            latest.error_message.as_deref(),
            Some("128k transcoding failed")
        );
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let repo = SqlJobRepository::new(memory_pool().await);
        let job = TranscodingJob::new("ch-1");
        repo.create(&job).await.unwrap();

        repo.update_progress(&job.id, 250).await.unwrap();
        let latest = repo.latest_for_chapter("ch-1").await.unwrap().unwrap();
        assert_eq!(latest.progress, 100);
    }

    #[tokio::test]
    async fn unknown_chapter_has_no_job() {
        let repo = SqlJobRepository::new(memory_pool().await);
        assert!(repo.latest_for_chapter("nope").await.unwrap().is_none());
    }
}

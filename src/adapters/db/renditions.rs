//! RenditionRepository over `transcoded_chapters`.

use crate::domain::model::{JobStatus, Rendition};
use crate::error::RepoError;
use crate::ports::repository::RenditionRepository;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

#[derive(Clone)]
pub struct SqlRenditionRepository {
    pool: SqlitePool,
}

impl SqlRenditionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RenditionRepository for SqlRenditionRepository {
    async fn upsert(&self, rendition: &Rendition) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO transcoded_chapters
                (id, chapter_id, bitrate, playlist_url, segments_path,
                 storage_provider, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chapter_id, bitrate) DO UPDATE SET
                playlist_url = excluded.playlist_url,
                segments_path = excluded.segments_path,
                storage_provider = excluded.storage_provider,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rendition.id)
        .bind(&rendition.chapter_id)
        .bind(rendition.bitrate)
        .bind(&rendition.playlist_url)
        .bind(&rendition.segments_path)
        .bind(&rendition.storage_provider)
        .bind(rendition.status)
        .bind(rendition.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, chapter_id: &str, bitrate: u32) -> Result<Option<Rendition>, RepoError> {
        let rendition = sqlx::query_as::<_, Rendition>(
            r#"
            SELECT id, chapter_id, bitrate, playlist_url, segments_path,
                   storage_provider, status, created_at, updated_at
            FROM transcoded_chapters
            WHERE chapter_id = ? AND bitrate = ?
            "#,
        )
        .bind(chapter_id)
        .bind(bitrate as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(rendition)
    }

    async fn completed_bitrates(&self, chapter_id: &str) -> Result<Vec<u32>, RepoError> {
        let rows = sqlx::query(
            r#"
            SELECT bitrate FROM transcoded_chapters
            WHERE chapter_id = ? AND status = ?
            ORDER BY bitrate ASC
            "#,
        )
        .bind(chapter_id)
        .bind(JobStatus::Completed)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<i64, _>("bitrate") as u32)
            .collect())
    }

    async fn delete_for_chapter(&self, chapter_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM transcoded_chapters WHERE chapter_id = ?")
            .bind(chapter_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::db::memory_pool;

    fn completed(chapter: &str, bitrate: u32) -> Rendition {
        Rendition::completed(
            chapter,
            bitrate,
            format!("storage/bit_transcode/{}/{}k/playlist.m3u8", chapter, bitrate),
            format!("bit_transcode/{}/{}k", chapter, bitrate),
            "local",
        )
    }

    #[tokio::test]
    async fn upsert_is_unique_per_chapter_and_bitrate() {
        let repo = SqlRenditionRepository::new(memory_pool().await);
        let first = completed("ch-1", 128);
        repo.upsert(&first).await.unwrap();

        // Second writer for the same shard wins on mutable fields.
        let mut second = completed("ch-1", 128);
        second.playlist_url = "elsewhere/playlist.m3u8".into();
        repo.upsert(&second).await.unwrap();

        let row = repo.get("ch-1", 128).await.unwrap().unwrap();
        assert_eq!(row.playlist_url, "elsewhere/playlist.m3u8");

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transcoded_chapters WHERE chapter_id = 'ch-1'")
                .fetch_one(&repo.pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn completed_bitrates_are_ascending() {
        let repo = SqlRenditionRepository::new(memory_pool().await);
        for bitrate in [256, 64, 128] {
            repo.upsert(&completed("ch-1", bitrate)).await.unwrap();
        }
        let mut failed = completed("ch-1", 320);
        failed.status = JobStatus::Failed;
        repo.upsert(&failed).await.unwrap();

        assert_eq!(
            repo.completed_bitrates("ch-1").await.unwrap(),
            vec![64, 128, 256]
        );
    }

    #[tokio::test]
    async fn delete_for_chapter_removes_all_rows() {
        let repo = SqlRenditionRepository::new(memory_pool().await);
        repo.upsert(&completed("ch-1", 64)).await.unwrap();
        repo.upsert(&completed("ch-1", 128)).await.unwrap();
        repo.upsert(&completed("ch-2", 64)).await.unwrap();

        assert_eq!(repo.delete_for_chapter("ch-1").await.unwrap(), 2);
        assert!(repo.completed_bitrates("ch-1").await.unwrap().is_empty());
        assert_eq!(repo.completed_bitrates("ch-2").await.unwrap(), vec![64]);
    }

    #[tokio::test]
    async fn get_missing_rendition() {
        let repo = SqlRenditionRepository::new(memory_pool().await);
        assert!(repo.get("ch-1", 64).await.unwrap().is_none());
    }
}

//! Relational state store.

pub mod jobs;
pub mod renditions;

pub use jobs::SqlJobRepository;
pub use renditions::SqlRenditionRepository;

use crate::error::RepoError;
use sqlx::sqlite::SqlitePool;

/// Open the pool and make sure the schema exists.
pub async fn connect(database_url: &str) -> Result<SqlitePool, RepoError> {
    let pool = SqlitePool::connect(database_url).await?;
    initialize_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent schema creation.
pub async fn initialize_schema(pool: &SqlitePool) -> Result<(), RepoError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcoding_jobs (
            id TEXT PRIMARY KEY,
            chapter_id TEXT NOT NULL,
            status TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_jobs_chapter_created
        ON transcoding_jobs (chapter_id, created_at DESC)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transcoded_chapters (
            id TEXT PRIMARY KEY,
            chapter_id TEXT NOT NULL,
            bitrate INTEGER NOT NULL,
            playlist_url TEXT NOT NULL,
            segments_path TEXT NOT NULL,
            storage_provider TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (chapter_id, bitrate)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// `SELECT 1` probe for the health endpoint.
pub async fn ping(pool: &SqlitePool) -> Result<(), RepoError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

// One connection only: every pooled connection to `sqlite::memory:` would
// otherwise get its own empty database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    initialize_schema(&pool).await.unwrap();
    pool
}

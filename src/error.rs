//! Error types, one enum per infrastructure concern plus a crate-level
//! aggregate used by the workers and the streaming service.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("s3 request failed: {0}")]
    S3(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("create pool error: {0}")]
    CreatePool(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<deadpool_redis::CreatePoolError> for QueueError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        QueueError::CreatePool(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        source: std::io::Error,
        program: String,
    },

    #[error("io error while driving encoder: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("encoder timed out after {0} seconds")]
    Timeout(u64),

    #[error("could not parse probe output: {0}")]
    Probe(String),
}

/// Crate-level error. Workers match on this to decide whether a failure is
/// retriable (encoder/storage/db) or deterministic (missing input).
#[derive(Debug, Error)]
pub enum Error {
    #[error("source file missing in storage: {0}")]
    InputMissing(String),

    #[error("no completed renditions for chapter {0}")]
    NoRenditions(String),

    #[error("rendition {bitrate}k for chapter {chapter_id} is not available")]
    RenditionUnavailable { chapter_id: String, bitrate: u32 },

    #[error("segment {0} not found")]
    SegmentNotFound(String),

    #[error("no rendition completed before the assembly deadline for chapter {0}")]
    MasterDeadline(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("{0}")]
    Config(String),
}

impl Error {
    /// Deterministic failures are not worth re-running through the backoff
    /// policy; everything else re-enters the queue.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Error::InputMissing(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_missing_is_not_retriable() {
        assert!(!Error::InputMissing("a/b.mp3".into()).is_retriable());
    }

    #[test]
    fn encoder_failures_are_retriable() {
        let err = Error::Encoder(EncoderError::Timeout(3600));
        assert!(err.is_retriable());
    }
}

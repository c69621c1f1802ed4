use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Size and modification time of a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Byte-addressable blob store. Providers are selected at startup; keys are
/// provider-independent (`bit_transcode/{chapter_id}/...`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Upload a local file to storage
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Upload an in-memory document to storage
    async fn upload_bytes(
        &self,
        data: &[u8],
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Download an object to a local path
    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError>;

    /// Read an object into memory
    async fn read(&self, key: &str) -> Result<Bytes, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// List object keys under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Client-reachable URL for an object
    fn url(&self, key: &str) -> String;

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Move an object; copy followed by delete for providers without rename
    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError>;

    /// Connectivity probe used by the health endpoint
    async fn test(&self) -> Result<(), StorageError>;

    /// Provider tag recorded on rendition rows (`local` or `s3`)
    fn provider(&self) -> &'static str;
}

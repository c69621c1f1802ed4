//! Object-store providers behind [`StoragePort`].

pub mod local;
pub mod s3;

use crate::config::{Config, StorageProviderKind};
use crate::ports::storage::StoragePort;
use std::sync::Arc;

pub use local::LocalStorage;
pub use s3::S3Storage;

/// Wire up the provider selected by `STORAGE_PROVIDER`.
pub async fn from_config(config: &Config) -> Arc<dyn StoragePort> {
    match config.storage_provider {
        StorageProviderKind::Local => Arc::new(LocalStorage::new(config.storage_root.clone())),
        StorageProviderKind::S3 => Arc::new(
            S3Storage::from_env(config.aws_bucket.clone(), config.aws_region.clone()).await,
        ),
    }
}

/// Reject keys that could escape the store's keyspace.
pub(crate) fn validate_key(key: &str) -> Result<(), crate::error::StorageError> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(crate::error::StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_traversal_and_absolute_keys() {
        assert!(validate_key("bit_transcode/ch-1/master.m3u8").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("").is_err());
    }
}

//! Filesystem provider. Keys map directly onto paths under the storage
//! root, so disjoint key prefixes are safe for concurrent writers.

use super::validate_key;
use crate::error::StorageError;
use crate::ports::storage::{ObjectMetadata, StoragePort};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn io_err(path: &Path, source: std::io::Error, key: &str) -> StorageError {
        if source.kind() == ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io {
                source,
                path: path.to_path_buf(),
            }
        }
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoragePort for LocalStorage {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let dest = self.object_path(key)?;
        // The encoder may already have written straight to the destination.
        if dest != local_path {
            Self::ensure_parent(&dest).await?;
            tokio::fs::copy(local_path, &dest)
                .await
                .map_err(|e| Self::io_err(local_path, e, key))?;
        }
        Ok(())
    }

    async fn upload_bytes(
        &self,
        data: &[u8],
        key: &str,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        let dest = self.object_path(key)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::write(&dest, data)
            .await
            .map_err(|e| Self::io_err(&dest, e, key))
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let src = self.object_path(key)?;
        if src != local_path {
            Self::ensure_parent(local_path).await?;
            tokio::fs::copy(&src, local_path)
                .await
                .map_err(|e| Self::io_err(&src, e, key))?;
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.object_path(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::io_err(&path, e, key))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Deleting an absent object is a no-op
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&path, e, key)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let base = self.object_path(prefix.trim_end_matches('/'))?;
        if !tokio::fs::try_exists(&base).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Self::io_err(&dir, e, prefix))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_err(&dir, e, prefix))?
            {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    keys.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn url(&self, key: &str) -> String {
        self.root.join(key).to_string_lossy().to_string()
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.object_path(from)?;
        let dest = self.object_path(to)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::copy(&src, &dest)
            .await
            .map_err(|e| Self::io_err(&src, e, from))?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let src = self.object_path(from)?;
        let dest = self.object_path(to)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::rename(&src, &dest)
            .await
            .map_err(|e| Self::io_err(&src, e, from))
    }

    async fn metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::io_err(&path, e, key))?;
        let last_modified = meta
            .modified()
            .ok()
            .map(|mtime| DateTime::<Utc>::from(mtime));
        Ok(ObjectMetadata {
            size: meta.len(),
            last_modified,
        })
    }

    async fn test(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: self.root.clone(),
            })?;
        let probe = format!(".probe_{}", uuid::Uuid::new_v4());
        self.upload_bytes(b"ok", &probe, "text/plain").await?;
        self.delete(&probe).await
    }

    fn provider(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempdir().unwrap();
        let storage = LocalStorage::new(dir.path().to_path_buf());
        (dir, storage)
    }

    #[tokio::test]
    async fn bytes_round_trip() {
        let (_dir, storage) = store();
        storage
            .upload_bytes(b"#EXTM3U", "bit_transcode/ch-1/64k/playlist.m3u8", "text")
            .await
            .unwrap();

        assert!(storage
            .exists("bit_transcode/ch-1/64k/playlist.m3u8")
            .await
            .unwrap());
        let data = storage
            .read("bit_transcode/ch-1/64k/playlist.m3u8")
            .await
            .unwrap();
        assert_eq!(&data[..], b"#EXTM3U");
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (_dir, storage) = store();
        match storage.read("nope/missing.ts").await {
            Err(StorageError::NotFound(key)) => assert_eq!(key, "nope/missing.ts"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn list_returns_sorted_keys_under_prefix() {
        let (_dir, storage) = store();
        for name in ["segment_001.ts", "segment_000.ts", "playlist.m3u8"] {
            storage
                .upload_bytes(b"x", &format!("bit_transcode/ch-1/64k/{}", name), "t")
                .await
                .unwrap();
        }
        storage
            .upload_bytes(b"x", "bit_transcode/ch-2/64k/segment_000.ts", "t")
            .await
            .unwrap();

        let keys = storage.list("bit_transcode/ch-1").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "bit_transcode/ch-1/64k/playlist.m3u8",
                "bit_transcode/ch-1/64k/segment_000.ts",
                "bit_transcode/ch-1/64k/segment_001.ts",
            ]
        );
    }

    #[tokio::test]
    async fn list_of_missing_prefix_is_empty() {
        let (_dir, storage) = store();
        assert!(storage.list("bit_transcode/none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_rename_delete() {
        let (_dir, storage) = store();
        storage.upload_bytes(b"a", "a/one.ts", "t").await.unwrap();

        storage.copy("a/one.ts", "a/two.ts").await.unwrap();
        assert!(storage.exists("a/two.ts").await.unwrap());

        storage.rename("a/two.ts", "b/three.ts").await.unwrap();
        assert!(!storage.exists("a/two.ts").await.unwrap());
        assert!(storage.exists("b/three.ts").await.unwrap());

        storage.delete("b/three.ts").await.unwrap();
        assert!(!storage.exists("b/three.ts").await.unwrap());
        // idempotent
        storage.delete("b/three.ts").await.unwrap();
    }

    #[tokio::test]
    async fn metadata_reports_size() {
        let (_dir, storage) = store();
        storage.upload_bytes(b"12345", "m/obj", "t").await.unwrap();
        let meta = storage.metadata("m/obj").await.unwrap();
        assert_eq!(meta.size, 5);
        assert!(meta.last_modified.is_some());
    }

    #[tokio::test]
    async fn health_probe_cleans_up() {
        let (_dir, storage) = store();
        storage.test().await.unwrap();
        assert!(storage.list("").await.is_err() || storage.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_from_local_file() {
        let (dir, storage) = store();
        let src = dir.path().join("src.ts");
        tokio::fs::write(&src, b"segment").await.unwrap();

        storage
            .upload(&src, "bit_transcode/ch-1/64k/segment_000.ts", "video/mp2t")
            .await
            .unwrap();
        let data = storage
            .read("bit_transcode/ch-1/64k/segment_000.ts")
            .await
            .unwrap();
        assert_eq!(&data[..], b"segment");
    }
}

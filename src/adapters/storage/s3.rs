//! S3 provider.

use super::validate_key;
use crate::error::StorageError;
use crate::ports::storage::{ObjectMetadata, StoragePort};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    region: String,
}

impl S3Storage {
    pub fn new(client: Client, bucket: String, region: String) -> Self {
        Self {
            client,
            bucket,
            region,
        }
    }

    /// Build a client from the ambient AWS environment (credentials chain,
    /// endpoint overrides for S3-compatible stores).
    pub async fn from_env(bucket: String, region: String) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;
        Self::new(Client::new(&config), bucket, region)
    }

    fn request_err<E: std::fmt::Debug>(err: E) -> StorageError {
        StorageError::S3(format!("{:?}", err))
    }
}

#[async_trait]
impl StoragePort for S3Storage {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::Io {
                source: std::io::Error::other(e),
                path: local_path.to_path_buf(),
            })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(Self::request_err)?;
        Ok(())
    }

    async fn upload_bytes(
        &self,
        data: &[u8],
        key: &str,
        content_type: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(Self::request_err)?;
        Ok(())
    }

    async fn download(&self, key: &str, local_path: &Path) -> Result<(), StorageError> {
        let data = self.read(key).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    source,
                    path: parent.to_path_buf(),
                })?;
        }
        tokio::fs::write(local_path, &data)
            .await
            .map_err(|source| StorageError::Io {
                source,
                path: local_path.to_path_buf(),
            })
    }

    async fn read(&self, key: &str) -> Result<Bytes, StorageError> {
        validate_key(key)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    Self::request_err(err)
                }
            })?;
        let body = resp.body.collect().await.map_err(Self::request_err)?;
        Ok(body.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::request_err)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(Self::request_err(err))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(Self::request_err)?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn url(&self, key: &str) -> String {
        format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            self.bucket, self.region, key
        )
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        validate_key(from)?;
        validate_key(to)?;
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, from))
            .key(to)
            .send()
            .await
            .map_err(Self::request_err)?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    async fn metadata(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        validate_key(key)?;
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    Self::request_err(err)
                }
            })?;
        let last_modified = head
            .last_modified()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), 0));
        Ok(ObjectMetadata {
            size: head.content_length().unwrap_or(0) as u64,
            last_modified,
        })
    }

    async fn test(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(Self::request_err)?;
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "s3"
    }
}

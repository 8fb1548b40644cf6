// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Where the worker stages catalogs and invocation logs: S3 in deployments,
//! the local filesystem for development and tests.

use crate::config::{LocalFileSystemStorageConfig, S3StorageConfig, WorkerStorageConfig};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid storage URL {0}")]
    InvalidUrl(String),
    #[error("Storage request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait WorkerStorage: Send + Sync {
    /// Writes an object at `s3://bucket/key`.
    async fn put(&self, url: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
}

pub async fn make_storage(config: &WorkerStorageConfig) -> Box<dyn WorkerStorage> {
    match config {
        WorkerStorageConfig::S3(config) => Box::new(S3WorkerStorage::new(config).await),
        WorkerStorageConfig::LocalFileSystem(config) => {
            Box::new(FileSystemWorkerStorage::new(config))
        }
    }
}

fn split_url(url: &str) -> Result<(String, String), StorageError> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
            Ok((bucket.to_string(), key.to_string()))
        }
        _ => Err(StorageError::InvalidUrl(url.to_string())),
    }
}

pub struct S3WorkerStorage {
    client: aws_sdk_s3::Client,
}

impl S3WorkerStorage {
    pub async fn new(config: &S3StorageConfig) -> Self {
        let region = aws_config::Region::new(config.region.clone());
        let mut loader = aws_config::from_env().region(region);
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.as_str());
        }
        let sdk_config = loader.load().await;
        Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
        }
    }
}

#[async_trait]
impl WorkerStorage for S3WorkerStorage {
    async fn put(&self, url: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let (bucket, key) = split_url(url)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;
        Ok(())
    }
}

/// Mirrors the bucket/key layout under a local root.
pub struct FileSystemWorkerStorage {
    root: PathBuf,
}

impl FileSystemWorkerStorage {
    pub fn new(config: &LocalFileSystemStorageConfig) -> Self {
        Self {
            root: config.root.clone(),
        }
    }
}

#[async_trait]
impl WorkerStorage for FileSystemWorkerStorage {
    async fn put(&self, url: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let (bucket, key) = split_url(url)?;
        let path = self.root.join(bucket).join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn filesystem_storage_mirrors_the_bucket_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemWorkerStorage::new(&LocalFileSystemStorageConfig {
            root: dir.path().to_path_buf(),
        });
        storage
            .put("s3://bucket/public/j1/7/catalog0.json", b"{}".to_vec())
            .await
            .unwrap();
        let written = dir.path().join("bucket/public/j1/7/catalog0.json");
        assert!(written.exists());
    }

    #[test]
    async fn invalid_urls_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSystemWorkerStorage::new(&LocalFileSystemStorageConfig {
            root: dir.path().to_path_buf(),
        });
        assert!(storage.put("http://nope", vec![]).await.is_err());
        assert!(storage.put("s3://bucket-only", vec![]).await.is_err());
    }
}

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

use crate::config::ObjectStoreConfig;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use harmony_common::model::{JobId, WorkItemId};
use harmony_common::SafeDisplay;

/// Prefix under which all user-visible outputs are staged. Objects outside
/// it are never turned into permalinks.
pub const PUBLIC_PREFIX: &str = "public/";

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("Invalid object store URL {0}")]
    InvalidUrl(String),
    #[error("Object store request failed: {0}")]
    Request(String),
}

impl SafeDisplay for ObjectStoreError {
    fn to_safe_string(&self) -> String {
        match self {
            ObjectStoreError::InvalidUrl(url) => format!("Invalid object store URL {url}"),
            ObjectStoreError::Request(_) => "Object store request failed".to_string(),
        }
    }
}

/// Splits `s3://bucket/key` into its parts.
pub fn parse_s3_url(url: &str) -> Result<(String, String), ObjectStoreError> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| ObjectStoreError::InvalidUrl(url.to_string()))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| ObjectStoreError::InvalidUrl(url.to_string()))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(ObjectStoreError::InvalidUrl(url.to_string()));
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Where a work item's service outputs land: `public/<jobID>/<workItemID>/`.
pub fn output_prefix(bucket: &str, job_id: &JobId, work_item_id: WorkItemId) -> String {
    format!("s3://{bucket}/{PUBLIC_PREFIX}{job_id}/{work_item_id}/")
}

/// Permalinks may only be generated for objects under the public prefix.
pub fn is_publicly_linkable(url: &str) -> bool {
    parse_s3_url(url)
        .map(|(_, key)| key.starts_with(PUBLIC_PREFIX))
        .unwrap_or(false)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, url: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError>;

    async fn get_object(&self, url: &str) -> Result<Vec<u8>, ObjectStoreError>;
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    pub async fn new(config: &ObjectStoreConfig) -> Self {
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
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, url: &str, bytes: Vec<u8>) -> Result<(), ObjectStoreError> {
        let (bucket, key) = parse_s3_url(url)?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(())
    }

    async fn get_object(&self, url: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let (bucket, key) = parse_s3_url(url)?;
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

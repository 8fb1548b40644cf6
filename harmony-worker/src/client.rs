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

use crate::config::WorkerConfig;
use async_trait::async_trait;
use harmony_common::model::{WorkForService, WorkItemCompletion};
use harmony_common::retries::with_retries;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Coordinator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Coordinator returned an unexpected status: {0}")]
    Unexpected(reqwest::StatusCode),
}

/// Result of reporting a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDisposition {
    Recorded,
    /// The item was already terminal (usually: the job was canceled). The
    /// worker discards its outputs.
    Discarded,
}

/// The coordinator operations the loop depends on, behind a trait so the
/// loop can be exercised without a network.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    async fn fetch_work(&self) -> Result<Option<WorkForService>, ClientError>;

    async fn complete_work(
        &self,
        id: i64,
        completion: &WorkItemCompletion,
    ) -> Result<CompletionDisposition, ClientError>;
}

pub struct CoordinatorClient {
    http: reqwest::Client,
    config: WorkerConfig,
}

impl CoordinatorClient {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: config.clone(),
        }
    }

    fn work_url(&self) -> Url {
        self.config
            .coordinator_url
            .join("/service/work")
            .expect("valid work URL")
    }

    fn completion_url(&self, id: i64) -> Url {
        self.config
            .coordinator_url
            .join(&format!("/service/work/{id}"))
            .expect("valid completion URL")
    }
}

#[async_trait]
impl CoordinatorApi for CoordinatorClient {
    /// Polls for work. Network failures are retried without bound: the
    /// worker must survive coordinator restarts of any length.
    async fn fetch_work(&self) -> Result<Option<WorkForService>, ClientError> {
        with_retries(
            "work fetch",
            &self.config.fetch_retries,
            || async {
                let response = self
                    .http
                    .get(self.work_url())
                    .query(&[
                        ("serviceID", self.config.service_id.as_str()),
                        ("podName", self.config.pod_name.as_str()),
                    ])
                    .send()
                    .await?;
                match response.status() {
                    reqwest::StatusCode::NOT_FOUND => Ok(None),
                    status if status.is_success() => {
                        Ok(Some(response.json::<WorkForService>().await?))
                    }
                    status => Err(ClientError::Unexpected(status)),
                }
            },
            |error| matches!(error, ClientError::Http(_)),
        )
        .await
    }

    /// Reports a completion with bounded retries so that a flaky network
    /// cannot produce duplicate results. A 409 means the item moved on
    /// without us; the outputs are dropped.
    async fn complete_work(
        &self,
        id: i64,
        completion: &WorkItemCompletion,
    ) -> Result<CompletionDisposition, ClientError> {
        with_retries(
            "work completion",
            &self.config.completion_retries,
            || async {
                let response = self
                    .http
                    .put(self.completion_url(id))
                    .json(completion)
                    .send()
                    .await?;
                match response.status() {
                    reqwest::StatusCode::CONFLICT => Ok(CompletionDisposition::Discarded),
                    status if status.is_success() => Ok(CompletionDisposition::Recorded),
                    status => Err(ClientError::Unexpected(status)),
                }
            },
            |error| matches!(error, ClientError::Http(_)),
        )
        .await
    }
}

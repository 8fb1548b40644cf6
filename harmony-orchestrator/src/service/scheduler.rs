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

//! Scheduling policy on top of the work repo: resolves per-service
//! concurrency caps from the registry and shapes claimed items for the
//! wire. The fairness and ordering rules themselves live in the claim
//! query, so they hold under concurrent claims.

use crate::registry::ServiceRegistry;
use crate::repo::work::WorkRepo;
use crate::repo::JobStoreError;
use harmony_common::model::{ServiceId, WorkForService};
use std::sync::Arc;
use tracing::debug;

pub struct Scheduler {
    work_repo: Arc<dyn WorkRepo>,
    registry: Arc<ServiceRegistry>,
    default_concurrency: i32,
    page_size: i32,
}

impl Scheduler {
    pub fn new(
        work_repo: Arc<dyn WorkRepo>,
        registry: Arc<ServiceRegistry>,
        default_concurrency: i32,
        page_size: i32,
    ) -> Self {
        Self {
            work_repo,
            registry,
            default_concurrency,
            page_size,
        }
    }

    /// Concurrency cap of the chain owning this service image.
    pub fn concurrency_cap_for(&self, service_id: &ServiceId) -> i32 {
        self.registry
            .services()
            .iter()
            .find(|s| {
                s.steps
                    .iter()
                    .any(|step| self.registry.image_for(step) == service_id.0)
            })
            .and_then(|s| s.concurrency)
            .unwrap_or(self.default_concurrency)
    }

    pub async fn claim(
        &self,
        service_id: &ServiceId,
        pod_name: &str,
    ) -> Result<Option<WorkForService>, JobStoreError> {
        let cap = self.concurrency_cap_for(service_id);
        let claimed = self
            .work_repo
            .claim_next_work_item(service_id, pod_name, cap)
            .await?;
        Ok(claimed.map(|claimed| {
            debug!(
                item = claimed.item.id.0,
                job = %claimed.item.job_id,
                pod = pod_name,
                "Assigned work item"
            );
            let max_cmr_granules = claimed
                .item
                .scroll_id
                .as_ref()
                .map(|_| i64::from(self.page_size));
            WorkForService {
                work_item: claimed.item.to_wire(claimed.operation),
                max_cmr_granules,
            }
        }))
    }
}

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

//! The coordinator side of the worker protocol: hand out work, accept
//! completions, refresh the service image map on deployments. Stateless
//! between requests; all ordering lives in the job store.

use crate::metrics;
use crate::model::{DeploymentCallback, ServiceBacklog};
use crate::registry::{image_basename, ServiceRegistry};
use crate::repo::work::{CompletionOutcome, CompletionPolicy, WorkRepo};
use crate::repo::JobStoreError;
use crate::service::scheduler::Scheduler;
use harmony_common::model::{ServiceId, WorkForService, WorkItemCompletion, WorkItemId};
use std::sync::Arc;
use tracing::{info, warn};

pub struct WorkCoordinator {
    scheduler: Arc<Scheduler>,
    work_repo: Arc<dyn WorkRepo>,
    policy: CompletionPolicy,
    registry: Arc<ServiceRegistry>,
    cookie_secret: String,
}

impl WorkCoordinator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        work_repo: Arc<dyn WorkRepo>,
        policy: CompletionPolicy,
        registry: Arc<ServiceRegistry>,
        cookie_secret: String,
    ) -> Self {
        Self {
            scheduler,
            work_repo,
            policy,
            registry,
            cookie_secret,
        }
    }

    pub async fn get_work(
        &self,
        service_id: &ServiceId,
        pod_name: &str,
    ) -> Result<Option<WorkForService>, JobStoreError> {
        let work = self.scheduler.claim(service_id, pod_name).await?;
        if work.is_some() {
            metrics::WORK_ITEMS_CLAIMED
                .with_label_values(&[service_id.0.as_str()])
                .inc();
        }
        Ok(work)
    }

    pub async fn complete_work(
        &self,
        id: WorkItemId,
        completion: &WorkItemCompletion,
    ) -> Result<CompletionOutcome, JobStoreError> {
        let outcome = self
            .work_repo
            .complete_work_item(id, completion, &self.policy)
            .await?;

        metrics::WORK_ITEMS_COMPLETED
            .with_label_values(&[outcome.item_status.to_string().as_str()])
            .inc();
        if outcome.requeued {
            info!(item = id.0, job = %outcome.job.id, "Requeued work item for retry");
        } else {
            info!(
                item = id.0,
                job = %outcome.job.id,
                status = %outcome.item_status,
                job_status = %outcome.job.status,
                "Recorded work item completion"
            );
        }
        if outcome.job.status.is_terminal() {
            metrics::JOB_TRANSITIONS
                .with_label_values(&[outcome.job.status.to_string().as_str()])
                .inc();
        }
        Ok(outcome)
    }

    pub async fn backlog(&self, service_id: &ServiceId) -> Result<ServiceBacklog, JobStoreError> {
        let available_work_items = self.work_repo.ready_count(service_id).await?;
        Ok(ServiceBacklog {
            available_work_items,
        })
    }

    /// Refreshes the in-memory image map after a service deployment. Guarded
    /// by the shared cookie secret; a mismatch is rejected without touching
    /// any state.
    pub fn handle_deployment_callback(
        &self,
        secret: &str,
        callback: &DeploymentCallback,
    ) -> Result<(), ()> {
        if secret != self.cookie_secret {
            warn!(
                service = %callback.deploy_service,
                "Rejected deployment callback with bad secret"
            );
            return Err(());
        }
        let service = image_basename(&callback.image);
        self.registry.update_image(&service, &callback.image);
        info!(service = %callback.deploy_service, image = %callback.image, "Refreshed service image");
        Ok(())
    }
}

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

//! Job lifecycle: creation (chain selection, CMR session, planning,
//! transactional bundle write), user-driven status transitions and labels.

use crate::clients::cmr::{CmrClient, CmrError, GranuleQuery};
use crate::model::Job;
use crate::planner::{self, PlanError, PlanInputs};
use crate::registry::{NoMatchingService, RequestContext, ServiceRegistry};
use crate::repo::job::JobRepo;
use crate::repo::JobStoreError;
use chrono::Utc;
use harmony_common::cache::TtlCache;
use harmony_common::model::{JobId, JobStatus, ProviderId};
use harmony_common::operation::OperationDocument;
use harmony_common::SafeDisplay;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("You are not authorized to access this job")]
    Forbidden,
    #[error(transparent)]
    NoMatch(#[from] NoMatchingService),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Cmr(#[from] CmrError),
    #[error("Job status cannot transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for JobServiceError {
    fn from(error: JobStoreError) -> Self {
        match error {
            JobStoreError::JobNotFound(id) => JobServiceError::NotFound(id),
            JobStoreError::InvalidTransition { from, to } => {
                JobServiceError::InvalidTransition { from, to }
            }
            other => JobServiceError::Store(other),
        }
    }
}

impl SafeDisplay for JobServiceError {
    fn to_safe_string(&self) -> String {
        match self {
            JobServiceError::Store(inner) => inner.to_safe_string(),
            JobServiceError::Cmr(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

/// A validated request as produced by the frontends, ready to be turned
/// into a job.
pub struct JobRequest {
    pub operation: OperationDocument,
    pub request_url: String,
    pub context: RequestContext,
    pub ignore_errors: bool,
}

pub struct JobService {
    job_repo: Arc<dyn JobRepo>,
    registry: Arc<ServiceRegistry>,
    cmr: Arc<dyn CmrClient>,
    provider_cache: TtlCache<JobId, ProviderId>,
    page_size: i32,
    max_granule_limit: i32,
}

impl JobService {
    pub fn new(
        job_repo: Arc<dyn JobRepo>,
        registry: Arc<ServiceRegistry>,
        cmr: Arc<dyn CmrClient>,
        page_size: i32,
        max_granule_limit: i32,
    ) -> Self {
        Self {
            job_repo,
            registry,
            cmr,
            provider_cache: TtlCache::new(Duration::from_secs(600), 4096),
            page_size,
            max_granule_limit,
        }
    }

    pub async fn create_job(&self, request: JobRequest) -> Result<Job, JobServiceError> {
        let operation = &request.operation;
        let chosen = self.registry.choose(operation, &request.context)?;

        let session = self
            .cmr
            .start_granule_session(
                &GranuleQuery {
                    collections: operation
                        .sources
                        .iter()
                        .map(|s| s.collection.clone())
                        .collect(),
                    temporal: operation.temporal.clone(),
                    readable_granule_name: None,
                },
                self.page_size,
                None,
            )
            .await?;

        let limit = chosen
            .config
            .granule_limit_for(&operation.collections())
            .unwrap_or(self.max_granule_limit)
            .min(self.max_granule_limit);
        let granule_count = session.hits.min(i64::from(limit)) as i32;

        let message = match &chosen.warning {
            Some(warning) => warning.clone(),
            None => JobStatus::Accepted.default_message().to_string(),
        };
        let now = Utc::now();
        let provider_id = operation
            .sources
            .first()
            .and_then(|s| s.collection.provider_id())
            .unwrap_or_else(|| ProviderId("unknown".to_string()));

        let job = Job {
            id: JobId::new_v4(),
            request_id: operation.request_id,
            username: operation.user.clone(),
            status: JobStatus::Accepted,
            message: message.clone(),
            messages: vec![crate::model::JobMessage {
                status: JobStatus::Accepted,
                message,
            }],
            progress: 0,
            request_url: request.request_url.clone(),
            is_async: !chosen.config.default_sync,
            num_input_granules: granule_count,
            collection_ids: operation.collections().into_iter().cloned().collect(),
            ignore_errors: request.ignore_errors,
            destination_url: operation.destination_url.clone(),
            service_name: chosen.config.name.clone(),
            provider_id,
            links: vec![],
            labels: vec![],
            created_at: now,
            updated_at: now,
        };

        let plan = planner::plan(&PlanInputs {
            job: &job,
            operation,
            service: chosen.config,
            registry: &self.registry,
            context: &request.context,
            scroll_ids: &[session.scroll_id.clone()],
            granule_count,
            page_size: self.page_size,
        })?;

        self.job_repo
            .create_job_bundle(&job, &plan.steps, &plan.user_work, &plan.initial_items)
            .await?;

        info!(
            job = %job.id,
            service = %job.service_name,
            granules = granule_count,
            steps = plan.steps.len(),
            "Created job"
        );
        Ok(job)
    }

    async fn owned_job(&self, id: &JobId, username: &str) -> Result<Job, JobServiceError> {
        let job = self
            .job_repo
            .get(id)
            .await?
            .ok_or(JobServiceError::NotFound(*id))?;
        if job.username != username {
            return Err(JobServiceError::Forbidden);
        }
        Ok(job)
    }

    pub async fn get_job(&self, id: &JobId, username: &str) -> Result<Job, JobServiceError> {
        self.owned_job(id, username).await
    }

    pub async fn cancel_job(&self, id: &JobId, username: &str) -> Result<Job, JobServiceError> {
        self.owned_job(id, username).await?;
        let job = self.job_repo.cancel_job(id, None).await?;
        self.provider_cache.invalidate(id);
        Ok(job)
    }

    pub async fn pause_job(&self, id: &JobId, username: &str) -> Result<Job, JobServiceError> {
        self.owned_job(id, username).await?;
        Ok(self
            .job_repo
            .transition_job(id, JobStatus::Paused, None)
            .await?)
    }

    pub async fn resume_job(&self, id: &JobId, username: &str) -> Result<Job, JobServiceError> {
        self.owned_job(id, username).await?;
        Ok(self
            .job_repo
            .transition_job(id, JobStatus::Running, None)
            .await?)
    }

    /// Moves a previewing job straight to running.
    pub async fn skip_preview(&self, id: &JobId, username: &str) -> Result<Job, JobServiceError> {
        self.owned_job(id, username).await?;
        Ok(self
            .job_repo
            .transition_job(id, JobStatus::Running, None)
            .await?)
    }

    pub async fn set_labels(
        &self,
        id: &JobId,
        username: &str,
        labels: &[String],
    ) -> Result<Vec<String>, JobServiceError> {
        self.owned_job(id, username).await?;
        Ok(self
            .job_repo
            .set_labels_for_job(id, username, labels)
            .await?)
    }

    pub async fn provider_of(&self, id: &JobId) -> Result<ProviderId, JobServiceError> {
        Ok(self
            .provider_cache
            .get_or_insert_with(id, || async { self.job_repo.provider_of(id).await })
            .await?)
    }
}

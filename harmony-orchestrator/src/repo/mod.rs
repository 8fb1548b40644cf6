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

//! Transactional persistence for jobs, workflow steps, work items and the
//! per-user scheduling rows. The claim and completion paths are single
//! transactions: a work item state change and everything derived from it
//! (step counters, user_work counters, next-step items, job transitions)
//! become visible atomically.

pub mod job;
pub mod work;

use crate::model::{Job, JobLink, JobMessage, UserWork, WorkItem, WorkflowStep};
use chrono::{DateTime, Utc};
use harmony_common::model::{
    CollectionId, JobId, JobStatus, ProviderId, RequestId, ServiceId, WorkItemId, WorkItemStatus,
};
use harmony_common::SafeDisplay;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("{0}")]
    Conversion(String),
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        "Internal repository error".to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Work item {0} not found")]
    WorkItemNotFound(WorkItemId),
    #[error("Work item {0} is already in a terminal state")]
    WorkItemAlreadyTerminal(WorkItemId),
    #[error("Workflow step {job_id}/{step_index} not found")]
    StepNotFound { job_id: JobId, step_index: i32 },
    #[error("Cannot add work items to terminal step {job_id}/{step_index}")]
    StepAlreadyTerminal { job_id: JobId, step_index: i32 },
    #[error("Job status cannot transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("A work item completion must carry a terminal status, got {0}")]
    InvalidCompletionStatus(WorkItemStatus),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<sqlx::Error> for JobStoreError {
    fn from(error: sqlx::Error) -> Self {
        JobStoreError::Repo(RepoError::Db(error))
    }
}

impl SafeDisplay for JobStoreError {
    fn to_safe_string(&self) -> String {
        match self {
            JobStoreError::Repo(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub request_id: Uuid,
    pub username: String,
    pub status: String,
    pub message: String,
    pub messages: String,
    pub progress: i32,
    pub request_url: String,
    pub is_async: bool,
    pub num_input_granules: i32,
    pub collection_ids: String,
    pub ignore_errors: bool,
    pub destination_url: Option<String>,
    pub service_name: String,
    pub provider_id: String,
    pub links: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = String;

    fn try_from(value: JobRecord) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&value.status)
            .map_err(|_| format!("Invalid job status: {}", value.status))?;
        let messages: Vec<JobMessage> = serde_json::from_str(&value.messages)
            .map_err(|e| format!("Invalid job messages: {e}"))?;
        let collection_ids: Vec<String> = serde_json::from_str(&value.collection_ids)
            .map_err(|e| format!("Invalid collection ids: {e}"))?;
        let links: Vec<JobLink> =
            serde_json::from_str(&value.links).map_err(|e| format!("Invalid job links: {e}"))?;
        Ok(Job {
            id: JobId(value.id),
            request_id: RequestId(value.request_id),
            username: value.username,
            status,
            message: value.message,
            messages,
            progress: value.progress,
            request_url: value.request_url,
            is_async: value.is_async,
            num_input_granules: value.num_input_granules,
            collection_ids: collection_ids.into_iter().map(CollectionId).collect(),
            ignore_errors: value.ignore_errors,
            destination_url: value.destination_url,
            service_name: value.service_name,
            provider_id: ProviderId(value.provider_id),
            links,
            labels: vec![],
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        JobRecord {
            id: job.id.0,
            request_id: job.request_id.0,
            username: job.username.clone(),
            status: job.status.to_string(),
            message: job.message.clone(),
            messages: serde_json::to_string(&job.messages).unwrap(),
            progress: job.progress,
            request_url: job.request_url.clone(),
            is_async: job.is_async,
            num_input_granules: job.num_input_granules,
            collection_ids: serde_json::to_string(
                &job.collection_ids.iter().map(|c| &c.0).collect::<Vec<_>>(),
            )
            .unwrap(),
            ignore_errors: job.ignore_errors,
            destination_url: job.destination_url.clone(),
            service_name: job.service_name.clone(),
            provider_id: job.provider_id.0.clone(),
            links: serde_json::to_string(&job.links).unwrap(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkflowStepRecord {
    pub job_id: Uuid,
    pub step_index: i32,
    pub service_id: String,
    pub operation: String,
    pub expected_count: Option<i32>,
    pub created_count: i32,
    pub successful_count: i32,
    pub failed_count: i32,
    pub is_aggregated: bool,
    pub is_batched: bool,
    pub is_sequential: bool,
    pub max_batch_inputs: Option<i32>,
    pub max_batch_size_bytes: Option<i64>,
    pub progress_weight: f64,
    pub is_complete: bool,
}

impl TryFrom<WorkflowStepRecord> for WorkflowStep {
    type Error = String;

    fn try_from(value: WorkflowStepRecord) -> Result<Self, Self::Error> {
        let operation = serde_json::from_str(&value.operation)
            .map_err(|e| format!("Invalid step operation document: {e}"))?;
        Ok(WorkflowStep {
            job_id: JobId(value.job_id),
            step_index: value.step_index,
            service_id: ServiceId(value.service_id),
            operation,
            expected_count: value.expected_count,
            created_count: value.created_count,
            successful_count: value.successful_count,
            failed_count: value.failed_count,
            is_aggregated: value.is_aggregated,
            is_batched: value.is_batched,
            is_sequential: value.is_sequential,
            max_batch_inputs: value.max_batch_inputs,
            max_batch_size_bytes: value.max_batch_size_bytes,
            progress_weight: value.progress_weight,
            is_complete: value.is_complete,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkItemRecord {
    pub id: i64,
    pub job_id: Uuid,
    pub service_id: String,
    pub step_index: i32,
    pub status: String,
    pub scroll_id: Option<String>,
    pub stac_catalog_locations: Option<String>,
    pub results: Option<String>,
    pub total_granules_size: i64,
    pub output_item_sizes: Option<String>,
    pub retry_count: i32,
    pub pod_name: Option<String>,
    pub error_message: Option<String>,
    pub sort_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRecord> for WorkItem {
    type Error = String;

    fn try_from(value: WorkItemRecord) -> Result<Self, Self::Error> {
        let status = WorkItemStatus::from_str(&value.status)
            .map_err(|_| format!("Invalid work item status: {}", value.status))?;
        let parse_list = |field: &Option<String>, name: &str| -> Result<Vec<String>, String> {
            match field {
                None => Ok(vec![]),
                Some(raw) => serde_json::from_str(raw).map_err(|e| format!("Invalid {name}: {e}")),
            }
        };
        let stac_catalog_locations =
            parse_list(&value.stac_catalog_locations, "work item inputs")?;
        let results = parse_list(&value.results, "work item results")?;
        let output_item_sizes: Vec<i64> = match &value.output_item_sizes {
            None => vec![],
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| format!("Invalid output sizes: {e}"))?
            }
        };
        Ok(WorkItem {
            id: WorkItemId(value.id),
            job_id: JobId(value.job_id),
            service_id: ServiceId(value.service_id),
            step_index: value.step_index,
            status,
            scroll_id: value.scroll_id,
            stac_catalog_locations,
            results,
            total_granules_size: value.total_granules_size,
            output_item_sizes,
            retry_count: value.retry_count,
            pod_name: value.pod_name,
            error_message: value.error_message,
            sort_index: value.sort_index,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UserWorkRecord {
    pub job_id: Uuid,
    pub service_id: String,
    pub username: String,
    pub ready_count: i32,
    pub running_count: i32,
    pub is_async: bool,
    pub last_worked: DateTime<Utc>,
}

impl From<UserWorkRecord> for UserWork {
    fn from(value: UserWorkRecord) -> Self {
        UserWork {
            job_id: JobId(value.job_id),
            service_id: ServiceId(value.service_id),
            username: value.username,
            ready_count: value.ready_count,
            running_count: value.running_count,
            is_async: value.is_async,
            last_worked: value.last_worked,
        }
    }
}

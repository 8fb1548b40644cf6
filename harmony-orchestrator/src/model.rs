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

use chrono::{DateTime, Utc};
use harmony_common::model::{
    CollectionId, JobId, JobStatus, ProviderId, RequestId, ServiceId, WorkItemId, WorkItemStatus,
    WorkItemWire,
};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The user-facing unit of execution; owns the workflow steps of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub request_id: RequestId,
    pub username: String,
    pub status: JobStatus,
    pub message: String,
    pub messages: Vec<JobMessage>,
    pub progress: i32,
    pub request_url: String,
    pub is_async: bool,
    pub num_input_granules: i32,
    pub collection_ids: Vec<CollectionId>,
    pub ignore_errors: bool,
    pub destination_url: Option<String>,
    pub service_name: String,
    pub provider_id: ProviderId,
    pub links: Vec<JobLink>,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The message shown for a status: the status default, optionally
    /// extended by operation-provided text and the destination notice.
    pub fn message_for(&self, status: JobStatus, detail: Option<&str>) -> String {
        let mut message = match detail {
            Some(detail) => detail.to_string(),
            None => status.default_message().to_string(),
        };
        if status == JobStatus::Successful {
            if let Some(destination) = &self.destination_url {
                message = format!("{message}. Results are at {destination}");
            }
        }
        message
    }

    pub fn with_status(mut self, status: JobStatus, message: String) -> Self {
        self.status = status;
        self.message = message.clone();
        self.messages.push(JobMessage { status, message });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct JobLink {
    pub href: String,
    pub rel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl JobLink {
    pub fn data(href: String, mime: Option<String>) -> Self {
        Self {
            href,
            rel: "data".to_string(),
            title: None,
            mime,
        }
    }
}

/// One stage of a job's service chain.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub job_id: JobId,
    /// 1-based.
    pub step_index: i32,
    pub service_id: ServiceId,
    /// The operation document projected for this step, in wire form.
    pub operation: serde_json::Value,
    /// `None` until the number of items for the step is known. The first
    /// step's count is known at planning time.
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

impl WorkflowStep {
    pub fn terminal_count(&self) -> i32 {
        self.successful_count + self.failed_count
    }

    /// A step is terminal once every expected item is terminal; under strict
    /// failure handling a single failed item already ends it.
    pub fn is_terminal(&self, ignore_errors: bool) -> bool {
        if !ignore_errors && self.failed_count > 0 {
            return true;
        }
        match self.expected_count {
            Some(expected) => self.terminal_count() >= expected,
            None => false,
        }
    }
}

/// Smallest unit of execution: one container invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub job_id: JobId,
    pub service_id: ServiceId,
    pub step_index: i32,
    pub status: WorkItemStatus,
    /// CMR session cursor; only the query step has one.
    pub scroll_id: Option<String>,
    /// Outputs of the previous step serving as this item's inputs.
    pub stac_catalog_locations: Vec<String>,
    /// STAC catalog URLs the service produced.
    pub results: Vec<String>,
    pub total_granules_size: i64,
    pub output_item_sizes: Vec<i64>,
    pub retry_count: i32,
    pub pod_name: Option<String>,
    pub error_message: Option<String>,
    pub sort_index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn to_wire(&self, operation: serde_json::Value) -> WorkItemWire {
        WorkItemWire {
            id: self.id.0,
            job_id: self.job_id.0,
            service_id: self.service_id.0.clone(),
            workflow_step_index: self.step_index,
            scroll_id: self.scroll_id.clone(),
            stac_catalog_locations: self.stac_catalog_locations.clone(),
            operation,
            retry_count: self.retry_count,
        }
    }
}

/// Insert shape for work items; ids and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkItem {
    pub job_id: JobId,
    pub service_id: ServiceId,
    pub step_index: i32,
    pub scroll_id: Option<String>,
    pub stac_catalog_locations: Vec<String>,
    pub sort_index: i64,
}

/// Per (job, service) scheduling row; `last_worked` drives user fairness.
#[derive(Debug, Clone, PartialEq)]
pub struct UserWork {
    pub job_id: JobId,
    pub service_id: ServiceId,
    pub username: String,
    pub ready_count: i32,
    pub running_count: i32,
    pub is_async: bool,
    pub last_worked: DateTime<Utc>,
}

/// Weighted job progress over its steps, clamped to 0..100. Steps whose item
/// count is still unknown contribute only once complete.
pub fn compute_progress(steps: &[WorkflowStep]) -> i32 {
    let total_weight: f64 = steps.iter().map(|s| s.progress_weight).sum();
    if total_weight <= 0.0 {
        return 0;
    }
    let done: f64 = steps
        .iter()
        .map(|s| {
            let fraction = if s.is_complete {
                1.0
            } else {
                match s.expected_count {
                    Some(expected) if expected > 0 => {
                        f64::from(s.terminal_count()) / f64::from(expected)
                    }
                    _ => 0.0,
                }
            };
            s.progress_weight * fraction.min(1.0)
        })
        .sum();
    // 100 is reserved for the terminal transition
    ((done / total_weight * 100.0) as i32).clamp(0, 99)
}

// API DTOs

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: Uuid,
    pub username: String,
    pub status: JobStatus,
    pub message: String,
    pub progress: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request: String,
    pub num_input_granules: i32,
    pub links: Vec<JobLink>,
    pub labels: Vec<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.0,
            username: job.username.clone(),
            status: job.status,
            message: job.message.clone(),
            progress: job.progress,
            created_at: job.created_at,
            updated_at: job.updated_at,
            request: job.request_url.clone(),
            num_input_granules: job.num_input_granules,
            links: job.links.clone(),
            labels: job.labels.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct LabelsRequest {
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct ServiceBacklog {
    pub available_work_items: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct DeploymentCallback {
    pub deploy_service: String,
    pub image: String,
    #[serde(default)]
    #[oai(default)]
    pub service_queue_urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use harmony_common::model::{JobId, ServiceId};

    fn step(weight: f64, expected: Option<i32>, successful: i32, complete: bool) -> WorkflowStep {
        WorkflowStep {
            job_id: JobId::new_v4(),
            step_index: 1,
            service_id: ServiceId("example".to_string()),
            operation: serde_json::json!({}),
            expected_count: expected,
            created_count: successful,
            successful_count: successful,
            failed_count: 0,
            is_aggregated: false,
            is_batched: false,
            is_sequential: false,
            max_batch_inputs: None,
            max_batch_size_bytes: None,
            progress_weight: weight,
            is_complete: complete,
        }
    }

    #[test]
    fn progress_is_weighted_and_never_reaches_100() {
        let steps = vec![
            step(0.1, Some(2), 2, true),
            step(1.0, Some(4), 2, false),
            step(1.0, None, 0, false),
        ];
        let progress = compute_progress(&steps);
        assert!(progress > 0 && progress < 100);

        let all_done = vec![step(0.1, Some(2), 2, true), step(1.0, Some(4), 4, true)];
        assert_eq!(compute_progress(&all_done), 99);
    }

    #[test]
    fn strict_steps_end_on_first_failure() {
        let mut s = step(1.0, Some(4), 1, false);
        s.failed_count = 1;
        assert!(s.is_terminal(false));
        assert!(!s.is_terminal(true));
        s.successful_count = 3;
        assert!(s.is_terminal(true));
    }
}

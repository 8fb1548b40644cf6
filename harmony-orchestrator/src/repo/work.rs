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

//! Work item claim and completion. Both are single transactions: every state
//! derived from a completion (step counters, staged batches, next-step
//! items, job transitions) becomes visible atomically with the item's own
//! terminal state.

use crate::clients::object_store::is_publicly_linkable;
use crate::failure::{classify_error, disposition, FailureDisposition};
use crate::model::{compute_progress, Job, JobLink, UserWork, WorkItem, WorkflowStep};
use crate::repo::{
    JobRecord, JobStoreError, RepoError, UserWorkRecord, WorkItemRecord, WorkflowStepRecord,
};
use async_trait::async_trait;
use chrono::Utc;
use harmony_common::model::{JobId, JobStatus, ServiceId, WorkItemCompletion, WorkItemId, WorkItemStatus};
use sqlx::{Database, Pool};
use std::sync::Arc;
use tracing::warn;

/// A claimed item together with the step-projected operation the worker
/// needs to invoke its service.
#[derive(Debug, Clone)]
pub struct ClaimedWork {
    pub item: WorkItem,
    pub operation: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CompletionPolicy {
    /// Retries per item for transient failures.
    pub retry_cap: i32,
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub job: Job,
    pub item_status: WorkItemStatus,
    pub requeued: bool,
}

#[async_trait]
pub trait WorkRepo: Send + Sync {
    /// Atomically selects one ready item for the service, marks it running
    /// and stamps the pod name. Selection is fair: the user (job) whose
    /// `last_worked` is oldest goes first, then the oldest ready item, ties
    /// broken by item id. Items of paused or terminal jobs, items beyond the
    /// service's concurrency cap, and items of sequential steps that already
    /// have one running item are not eligible.
    async fn claim_next_work_item(
        &self,
        service_id: &ServiceId,
        pod_name: &str,
        concurrency_cap: i32,
    ) -> Result<Option<ClaimedWork>, JobStoreError>;

    /// Applies a worker-reported completion: decides retry vs terminal via
    /// the failure policy, updates step counters, stages or emits next-step
    /// work, and drives the job status machine. A completion for an item
    /// that is already terminal is rejected without any state change.
    async fn complete_work_item(
        &self,
        id: WorkItemId,
        completion: &WorkItemCompletion,
        policy: &CompletionPolicy,
    ) -> Result<CompletionOutcome, JobStoreError>;

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, JobStoreError>;

    async fn items_for_step(
        &self,
        job_id: &JobId,
        step_index: i32,
    ) -> Result<Vec<WorkItem>, JobStoreError>;

    async fn user_work_for(&self, job_id: &JobId) -> Result<Vec<UserWork>, JobStoreError>;

    /// Ready backlog for a service; drives worker pool sizing.
    async fn ready_count(&self, service_id: &ServiceId) -> Result<i64, JobStoreError>;
}

pub struct DbWorkRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbWorkRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

// The claim/completion selects exist in two renditions: the Postgres one
// appends a row-locking suffix, SQLite relies on its single-writer model.
macro_rules! claim_candidate_sql {
    () => {
        claim_candidate_sql!("")
    };
    ($suffix:literal) => {
        concat!(
            "SELECT w.id, w.job_id, w.service_id, w.step_index, w.status, w.scroll_id, \
             w.stac_catalog_locations, w.results, w.total_granules_size, w.output_item_sizes, \
             w.retry_count, w.pod_name, w.error_message, w.sort_index, w.created_at, w.updated_at \
             FROM work_items w \
             JOIN user_work uw ON uw.job_id = w.job_id AND uw.service_id = w.service_id \
             JOIN jobs j ON j.id = w.job_id \
             WHERE w.service_id = $1 AND w.status = 'ready' \
               AND j.status IN ('accepted', 'previewing', 'running') \
               AND NOT EXISTS (SELECT 1 FROM workflow_steps s \
                    WHERE s.job_id = w.job_id AND s.step_index = w.step_index AND s.is_sequential \
                      AND EXISTS (SELECT 1 FROM work_items r \
                           WHERE r.job_id = w.job_id AND r.step_index = w.step_index \
                             AND r.status = 'running')) \
             ORDER BY uw.last_worked ASC, uw.username ASC, w.sort_index ASC, w.id ASC \
             LIMIT 1",
            $suffix
        )
    };
}

macro_rules! select_item_sql {
    () => {
        select_item_sql!("")
    };
    ($suffix:literal) => {
        concat!(
            "SELECT id, job_id, service_id, step_index, status, scroll_id, \
             stac_catalog_locations, results, total_granules_size, output_item_sizes, \
             retry_count, pod_name, error_message, sort_index, created_at, updated_at \
             FROM work_items WHERE id = $1",
            $suffix
        )
    };
}

macro_rules! select_job_sql {
    () => {
        select_job_sql!("")
    };
    ($suffix:literal) => {
        concat!(
            "SELECT id, request_id, username, status, message, messages, progress, request_url, \
             is_async, num_input_granules, collection_ids, ignore_errors, destination_url, \
             service_name, provider_id, links, created_at, updated_at FROM jobs WHERE id = $1",
            $suffix
        )
    };
}

const RUNNING_COUNT: &str =
    "SELECT count(*) FROM work_items WHERE service_id = $1 AND status = 'running'";

const READY_COUNT: &str =
    "SELECT count(*) FROM work_items WHERE service_id = $1 AND status = 'ready'";

const MARK_RUNNING: &str =
    "UPDATE work_items SET status = 'running', pod_name = $2, updated_at = $3 WHERE id = $1";

const CLAIM_USER_WORK: &str = "UPDATE user_work SET ready_count = ready_count - 1, \
     running_count = running_count + 1, last_worked = $3 WHERE job_id = $1 AND service_id = $2";

const REQUEUE_ITEM: &str = "UPDATE work_items SET status = 'ready', retry_count = retry_count + 1, \
     pod_name = NULL, updated_at = $2 WHERE id = $1";

const REQUEUE_USER_WORK: &str = "UPDATE user_work SET ready_count = ready_count + 1, \
     running_count = running_count - 1 WHERE job_id = $1 AND service_id = $2";

const FINISH_ITEM: &str = "UPDATE work_items SET status = $2, results = $3, \
     total_granules_size = $4, output_item_sizes = $5, error_message = $6, updated_at = $7 \
     WHERE id = $1";

const FINISH_USER_WORK: &str = "UPDATE user_work SET running_count = running_count - 1 \
     WHERE job_id = $1 AND service_id = $2 AND running_count > 0";

const SELECT_STEP: &str = "SELECT job_id, step_index, service_id, operation, expected_count, \
     created_count, successful_count, failed_count, is_aggregated, is_batched, is_sequential, \
     max_batch_inputs, max_batch_size_bytes, progress_weight, is_complete \
     FROM workflow_steps WHERE job_id = $1 AND step_index = $2";

const SELECT_ALL_STEPS: &str = "SELECT job_id, step_index, service_id, operation, expected_count, \
     created_count, successful_count, failed_count, is_aggregated, is_batched, is_sequential, \
     max_batch_inputs, max_batch_size_bytes, progress_weight, is_complete \
     FROM workflow_steps WHERE job_id = $1 ORDER BY step_index";

const UPDATE_STEP_COUNTS: &str = "UPDATE workflow_steps SET expected_count = $3, \
     created_count = $4, successful_count = $5, failed_count = $6, is_complete = $7 \
     WHERE job_id = $1 AND step_index = $2";

const STEP_OPERATION: &str =
    "SELECT operation FROM workflow_steps WHERE job_id = $1 AND step_index = $2";

const INSERT_WORK_ITEM: &str = "INSERT INTO work_items \
     (job_id, service_id, step_index, status, scroll_id, stac_catalog_locations, sort_index, \
      created_at, updated_at) \
     VALUES ($1, $2, $3, 'ready', $4, $5, $6, $7, $8)";

const ADD_READY: &str = "UPDATE user_work SET ready_count = ready_count + $3 \
     WHERE job_id = $1 AND service_id = $2";

const UPDATE_JOB_STATUS: &str = "UPDATE jobs SET status = $2, message = $3, messages = $4, \
     progress = $5, links = $6, updated_at = $7 WHERE id = $1";

const UPDATE_JOB_PROGRESS: &str = "UPDATE jobs SET progress = $2, updated_at = $3 WHERE id = $1";

const CANCEL_JOB_ITEMS: &str = "UPDATE work_items SET status = 'canceled', updated_at = $2 \
     WHERE job_id = $1 AND status IN ('ready', 'queued', 'running')";

const DELETE_USER_WORK: &str = "DELETE FROM user_work WHERE job_id = $1";

const SELECT_LAST_BATCH: &str = "SELECT batch_number, is_closed, input_count, total_size_bytes \
     FROM batches WHERE job_id = $1 AND step_index = $2 ORDER BY batch_number DESC LIMIT 1";

const INSERT_BATCH: &str = "INSERT INTO batches \
     (job_id, step_index, batch_number, is_closed, input_count, total_size_bytes) \
     VALUES ($1, $2, $3, false, 0, 0)";

const UPDATE_BATCH: &str = "UPDATE batches SET input_count = $4, total_size_bytes = $5, \
     is_closed = $6 WHERE job_id = $1 AND step_index = $2 AND batch_number = $3";

const INSERT_BATCH_ITEM: &str = "INSERT INTO batch_items \
     (job_id, step_index, batch_number, sort_index, stac_location, size_bytes) \
     VALUES ($1, $2, $3, $4, $5, $6)";

const SELECT_BATCH_LOCATIONS: &str = "SELECT stac_location FROM batch_items \
     WHERE job_id = $1 AND step_index = $2 AND batch_number = $3 ORDER BY sort_index";

const SELECT_STEP_OUTPUTS: &str = "SELECT results FROM work_items \
     WHERE job_id = $1 AND step_index = $2 AND status = 'successful' ORDER BY sort_index, id";

const ITEMS_FOR_STEP: &str = "SELECT id, job_id, service_id, step_index, status, scroll_id, \
     stac_catalog_locations, results, total_granules_size, output_item_sizes, retry_count, \
     pod_name, error_message, sort_index, created_at, updated_at \
     FROM work_items WHERE job_id = $1 AND step_index = $2 ORDER BY sort_index, id";

const USER_WORK_FOR_JOB: &str = "SELECT job_id, service_id, username, ready_count, \
     running_count, is_async, last_worked FROM user_work WHERE job_id = $1 ORDER BY service_id";

#[derive(sqlx::FromRow, Debug, Clone)]
struct BatchRecord {
    batch_number: i32,
    is_closed: bool,
    input_count: i32,
    total_size_bytes: i64,
}

fn locations_json(locations: &[String]) -> Option<String> {
    if locations.is_empty() {
        None
    } else {
        Some(serde_json::to_string(locations).unwrap())
    }
}

enum Decision {
    Requeue,
    Final {
        status: WorkItemStatus,
        fail_job: bool,
    },
}

fn decide(
    completion: &WorkItemCompletion,
    retry_count: i32,
    policy: &CompletionPolicy,
) -> Result<Decision, JobStoreError> {
    match completion.status {
        WorkItemStatus::Successful => Ok(Decision::Final {
            status: WorkItemStatus::Successful,
            fail_job: false,
        }),
        WorkItemStatus::Canceled => Ok(Decision::Final {
            status: WorkItemStatus::Canceled,
            fail_job: false,
        }),
        WorkItemStatus::Failed => {
            let kind = classify_error(completion.error_kind, completion.error.as_deref());
            Ok(match disposition(kind, retry_count, policy.retry_cap) {
                FailureDisposition::Retry => Decision::Requeue,
                FailureDisposition::FailItem => Decision::Final {
                    status: WorkItemStatus::Failed,
                    fail_job: false,
                },
                FailureDisposition::FailJob => Decision::Final {
                    status: WorkItemStatus::Failed,
                    fail_job: true,
                },
            })
        }
        other => Err(JobStoreError::InvalidCompletionStatus(other)),
    }
}

macro_rules! work_repo_impl {
    ($db:ty, $claim_sql:expr, $item_sql:expr, $job_sql:expr) => {
        #[async_trait]
        impl WorkRepo for DbWorkRepo<$db> {
            async fn claim_next_work_item(
                &self,
                service_id: &ServiceId,
                pod_name: &str,
                concurrency_cap: i32,
            ) -> Result<Option<ClaimedWork>, JobStoreError> {
                let mut tx = self.db_pool.begin().await?;
                let now = Utc::now();

                let (running,): (i64,) = sqlx::query_as(RUNNING_COUNT)
                    .bind(&service_id.0)
                    .fetch_one(&mut *tx)
                    .await?;
                if running >= i64::from(concurrency_cap) {
                    return Ok(None);
                }

                let record = sqlx::query_as::<_, WorkItemRecord>($claim_sql)
                    .bind(&service_id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
                let Some(record) = record else {
                    return Ok(None);
                };
                let mut item: WorkItem = record.try_into().map_err(RepoError::Conversion)?;

                sqlx::query(MARK_RUNNING)
                    .bind(item.id.0)
                    .bind(pod_name)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                item.status = WorkItemStatus::Running;
                item.pod_name = Some(pod_name.to_string());

                sqlx::query(CLAIM_USER_WORK)
                    .bind(item.job_id.0)
                    .bind(&service_id.0)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                // the first claim moves an accepted job to running
                let job_record = sqlx::query_as::<_, JobRecord>($job_sql)
                    .bind(item.job_id.0)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::JobNotFound(item.job_id))?;
                let job: Job = job_record.try_into().map_err(RepoError::Conversion)?;
                if job.status == JobStatus::Accepted {
                    let message = job.message_for(JobStatus::Running, None);
                    let updated = job.clone().with_status(JobStatus::Running, message);
                    sqlx::query(UPDATE_JOB_STATUS)
                        .bind(updated.id.0)
                        .bind(updated.status.to_string())
                        .bind(&updated.message)
                        .bind(serde_json::to_string(&updated.messages).unwrap())
                        .bind(updated.progress)
                        .bind(serde_json::to_string(&updated.links).unwrap())
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                }

                let (operation,): (String,) = sqlx::query_as(STEP_OPERATION)
                    .bind(item.job_id.0)
                    .bind(item.step_index)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::StepNotFound {
                        job_id: item.job_id,
                        step_index: item.step_index,
                    })?;
                let operation: serde_json::Value = serde_json::from_str(&operation)
                    .map_err(|e| RepoError::Conversion(format!("Invalid step operation: {e}")))?;

                tx.commit().await?;
                Ok(Some(ClaimedWork { item, operation }))
            }

            async fn complete_work_item(
                &self,
                id: WorkItemId,
                completion: &WorkItemCompletion,
                policy: &CompletionPolicy,
            ) -> Result<CompletionOutcome, JobStoreError> {
                let mut tx = self.db_pool.begin().await?;
                let now = Utc::now();

                let record = sqlx::query_as::<_, WorkItemRecord>($item_sql)
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::WorkItemNotFound(id))?;
                let item: WorkItem = record.try_into().map_err(RepoError::Conversion)?;
                if item.status.is_terminal() {
                    return Err(JobStoreError::WorkItemAlreadyTerminal(id));
                }

                let job_record = sqlx::query_as::<_, JobRecord>($job_sql)
                    .bind(item.job_id.0)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::JobNotFound(item.job_id))?;
                let mut job: Job = job_record.try_into().map_err(RepoError::Conversion)?;

                let step_record = sqlx::query_as::<_, WorkflowStepRecord>(SELECT_STEP)
                    .bind(item.job_id.0)
                    .bind(item.step_index)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::StepNotFound {
                        job_id: item.job_id,
                        step_index: item.step_index,
                    })?;
                let mut step: WorkflowStep =
                    step_record.try_into().map_err(RepoError::Conversion)?;

                let decision = decide(completion, item.retry_count, policy)?;

                if let Decision::Requeue = decision {
                    sqlx::query(REQUEUE_ITEM)
                        .bind(id.0)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(REQUEUE_USER_WORK)
                        .bind(item.job_id.0)
                        .bind(&item.service_id.0)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    return Ok(CompletionOutcome {
                        job,
                        item_status: WorkItemStatus::Ready,
                        requeued: true,
                    });
                }

                let Decision::Final { status: final_status, fail_job } = decision else {
                    unreachable!()
                };

                sqlx::query(FINISH_ITEM)
                    .bind(id.0)
                    .bind(final_status.to_string())
                    .bind(locations_json(&completion.results))
                    .bind(completion.total_granules_size)
                    .bind(serde_json::to_string(&completion.output_item_sizes).unwrap())
                    .bind(completion.error.as_deref())
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query(FINISH_USER_WORK)
                    .bind(item.job_id.0)
                    .bind(&item.service_id.0)
                    .execute(&mut *tx)
                    .await?;

                match final_status {
                    WorkItemStatus::Successful => step.successful_count += 1,
                    WorkItemStatus::Failed => step.failed_count += 1,
                    _ => {}
                }

                // strict mode: the first non-retryable failure ends the job
                // and cancels everything still in flight
                let strict_failure = final_status == WorkItemStatus::Failed && !job.ignore_errors;
                if fail_job || strict_failure {
                    sqlx::query(UPDATE_STEP_COUNTS)
                        .bind(step.job_id.0)
                        .bind(step.step_index)
                        .bind(step.expected_count)
                        .bind(step.created_count)
                        .bind(step.successful_count)
                        .bind(step.failed_count)
                        .bind(step.is_complete)
                        .execute(&mut *tx)
                        .await?;

                    if !job.status.is_terminal() {
                        let message = job.message_for(
                            JobStatus::Failed,
                            completion.error.as_deref(),
                        );
                        job = job.with_status(JobStatus::Failed, message);
                        sqlx::query(UPDATE_JOB_STATUS)
                            .bind(job.id.0)
                            .bind(job.status.to_string())
                            .bind(&job.message)
                            .bind(serde_json::to_string(&job.messages).unwrap())
                            .bind(job.progress)
                            .bind(serde_json::to_string(&job.links).unwrap())
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                        sqlx::query(CANCEL_JOB_ITEMS)
                            .bind(job.id.0)
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                        sqlx::query(DELETE_USER_WORK)
                            .bind(job.id.0)
                            .execute(&mut *tx)
                            .await?;
                    }

                    tx.commit().await?;
                    return Ok(CompletionOutcome {
                        job,
                        item_status: final_status,
                        requeued: false,
                    });
                }

                // CMR query session continuation: one item per page, created
                // as the previous page completes
                if item.scroll_id.is_some() {
                    if let (Some(next_scroll), Some(expected)) =
                        (&completion.scroll_id, step.expected_count)
                    {
                        if step.created_count < expected {
                            sqlx::query(INSERT_WORK_ITEM)
                                .bind(item.job_id.0)
                                .bind(&item.service_id.0)
                                .bind(item.step_index)
                                .bind(Some(next_scroll.as_str()))
                                .bind(Option::<String>::None)
                                .bind(i64::from(step.created_count))
                                .bind(now)
                                .bind(now)
                                .execute(&mut *tx)
                                .await?;
                            step.created_count += 1;
                            sqlx::query(ADD_READY)
                                .bind(item.job_id.0)
                                .bind(&item.service_id.0)
                                .bind(1i32)
                                .execute(&mut *tx)
                                .await?;
                        }
                    }
                }

                let next_index = item.step_index + 1;
                let next_record = sqlx::query_as::<_, WorkflowStepRecord>(SELECT_STEP)
                    .bind(item.job_id.0)
                    .bind(next_index)
                    .fetch_optional(&mut *tx)
                    .await?;
                let mut next: Option<WorkflowStep> = match next_record {
                    Some(record) => Some(record.try_into().map_err(RepoError::Conversion)?),
                    None => None,
                };

                // input sets for new next-step items
                let mut next_inputs: Vec<Vec<String>> = Vec::new();

                if final_status == WorkItemStatus::Successful {
                    if let Some(next_step) = &next {
                        if next_step.is_batched {
                            for (i, result) in completion.results.iter().enumerate() {
                                let size =
                                    completion.output_item_sizes.get(i).copied().unwrap_or(0);

                                let last = sqlx::query_as::<_, BatchRecord>(SELECT_LAST_BATCH)
                                    .bind(item.job_id.0)
                                    .bind(next_index)
                                    .fetch_optional(&mut *tx)
                                    .await?;
                                let mut batch = match last {
                                    Some(batch) if !batch.is_closed => batch,
                                    Some(batch) => {
                                        let number = batch.batch_number + 1;
                                        sqlx::query(INSERT_BATCH)
                                            .bind(item.job_id.0)
                                            .bind(next_index)
                                            .bind(number)
                                            .execute(&mut *tx)
                                            .await?;
                                        BatchRecord {
                                            batch_number: number,
                                            is_closed: false,
                                            input_count: 0,
                                            total_size_bytes: 0,
                                        }
                                    }
                                    None => {
                                        sqlx::query(INSERT_BATCH)
                                            .bind(item.job_id.0)
                                            .bind(next_index)
                                            .bind(0i32)
                                            .execute(&mut *tx)
                                            .await?;
                                        BatchRecord {
                                            batch_number: 0,
                                            is_closed: false,
                                            input_count: 0,
                                            total_size_bytes: 0,
                                        }
                                    }
                                };

                                // close the open batch first when this output
                                // would push it over the byte bound
                                if let Some(max_bytes) = next_step.max_batch_size_bytes {
                                    if batch.input_count > 0
                                        && batch.total_size_bytes + size > max_bytes
                                    {
                                        sqlx::query(UPDATE_BATCH)
                                            .bind(item.job_id.0)
                                            .bind(next_index)
                                            .bind(batch.batch_number)
                                            .bind(batch.input_count)
                                            .bind(batch.total_size_bytes)
                                            .bind(true)
                                            .execute(&mut *tx)
                                            .await?;
                                        let rows: Vec<(String,)> =
                                            sqlx::query_as(SELECT_BATCH_LOCATIONS)
                                                .bind(item.job_id.0)
                                                .bind(next_index)
                                                .bind(batch.batch_number)
                                                .fetch_all(&mut *tx)
                                                .await?;
                                        next_inputs
                                            .push(rows.into_iter().map(|(l,)| l).collect());

                                        let number = batch.batch_number + 1;
                                        sqlx::query(INSERT_BATCH)
                                            .bind(item.job_id.0)
                                            .bind(next_index)
                                            .bind(number)
                                            .execute(&mut *tx)
                                            .await?;
                                        batch = BatchRecord {
                                            batch_number: number,
                                            is_closed: false,
                                            input_count: 0,
                                            total_size_bytes: 0,
                                        };
                                    }
                                }

                                sqlx::query(INSERT_BATCH_ITEM)
                                    .bind(item.job_id.0)
                                    .bind(next_index)
                                    .bind(batch.batch_number)
                                    .bind(batch.input_count)
                                    .bind(result)
                                    .bind(size)
                                    .execute(&mut *tx)
                                    .await?;
                                batch.input_count += 1;
                                batch.total_size_bytes += size;

                                let full = next_step
                                    .max_batch_inputs
                                    .map(|max| batch.input_count >= max)
                                    .unwrap_or(false);
                                sqlx::query(UPDATE_BATCH)
                                    .bind(item.job_id.0)
                                    .bind(next_index)
                                    .bind(batch.batch_number)
                                    .bind(batch.input_count)
                                    .bind(batch.total_size_bytes)
                                    .bind(full)
                                    .execute(&mut *tx)
                                    .await?;
                                if full {
                                    let rows: Vec<(String,)> =
                                        sqlx::query_as(SELECT_BATCH_LOCATIONS)
                                            .bind(item.job_id.0)
                                            .bind(next_index)
                                            .bind(batch.batch_number)
                                            .fetch_all(&mut *tx)
                                            .await?;
                                    next_inputs.push(rows.into_iter().map(|(l,)| l).collect());
                                }
                            }
                        } else if !next_step.is_aggregated {
                            for result in &completion.results {
                                next_inputs.push(vec![result.clone()]);
                            }
                        }
                    }
                }

                // terminal evaluation for this step
                let step_terminal = step.is_terminal(job.ignore_errors);
                if step_terminal && !step.is_complete {
                    step.is_complete = true;
                    if step.expected_count.is_none() {
                        step.expected_count = Some(step.terminal_count());
                    }
                }
                sqlx::query(UPDATE_STEP_COUNTS)
                    .bind(step.job_id.0)
                    .bind(step.step_index)
                    .bind(step.expected_count)
                    .bind(step.created_count)
                    .bind(step.successful_count)
                    .bind(step.failed_count)
                    .bind(step.is_complete)
                    .execute(&mut *tx)
                    .await?;

                if step_terminal {
                    if let Some(next_step) = &next {
                        if next_step.is_batched {
                            // flush the trailing partial batch
                            let last = sqlx::query_as::<_, BatchRecord>(SELECT_LAST_BATCH)
                                .bind(item.job_id.0)
                                .bind(next_index)
                                .fetch_optional(&mut *tx)
                                .await?;
                            if let Some(batch) = last {
                                if !batch.is_closed && batch.input_count > 0 {
                                    sqlx::query(UPDATE_BATCH)
                                        .bind(item.job_id.0)
                                        .bind(next_index)
                                        .bind(batch.batch_number)
                                        .bind(batch.input_count)
                                        .bind(batch.total_size_bytes)
                                        .bind(true)
                                        .execute(&mut *tx)
                                        .await?;
                                    let rows: Vec<(String,)> =
                                        sqlx::query_as(SELECT_BATCH_LOCATIONS)
                                            .bind(item.job_id.0)
                                            .bind(next_index)
                                            .bind(batch.batch_number)
                                            .fetch_all(&mut *tx)
                                            .await?;
                                    next_inputs.push(rows.into_iter().map(|(l,)| l).collect());
                                }
                            }
                        } else if next_step.is_aggregated {
                            // aggregated steps start only once every input of
                            // the source step exists
                            let rows: Vec<(Option<String>,)> =
                                sqlx::query_as(SELECT_STEP_OUTPUTS)
                                    .bind(item.job_id.0)
                                    .bind(item.step_index)
                                    .fetch_all(&mut *tx)
                                    .await?;
                            let mut outputs: Vec<String> = Vec::new();
                            for (raw,) in rows {
                                if let Some(raw) = raw {
                                    let list: Vec<String> =
                                        serde_json::from_str(&raw).map_err(|e| {
                                            RepoError::Conversion(format!(
                                                "Invalid work item results: {e}"
                                            ))
                                        })?;
                                    outputs.extend(list);
                                }
                            }
                            if !outputs.is_empty() {
                                next_inputs.push(outputs);
                            }
                        }
                    }
                }

                if let Some(next_step) = next.as_mut() {
                    if !next_inputs.is_empty() && next_step.is_complete {
                        return Err(JobStoreError::StepAlreadyTerminal {
                            job_id: next_step.job_id,
                            step_index: next_step.step_index,
                        });
                    }
                    for input_set in &next_inputs {
                        sqlx::query(INSERT_WORK_ITEM)
                            .bind(item.job_id.0)
                            .bind(&next_step.service_id.0)
                            .bind(next_index)
                            .bind(Option::<String>::None)
                            .bind(locations_json(input_set))
                            .bind(i64::from(next_step.created_count))
                            .bind(now)
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                        next_step.created_count += 1;
                    }
                    if !next_inputs.is_empty() {
                        sqlx::query(ADD_READY)
                            .bind(item.job_id.0)
                            .bind(&next_step.service_id.0)
                            .bind(next_inputs.len() as i32)
                            .execute(&mut *tx)
                            .await?;
                    }
                    sqlx::query(UPDATE_STEP_COUNTS)
                        .bind(next_step.job_id.0)
                        .bind(next_step.step_index)
                        .bind(next_step.expected_count)
                        .bind(next_step.created_count)
                        .bind(next_step.successful_count)
                        .bind(next_step.failed_count)
                        .bind(next_step.is_complete)
                        .execute(&mut *tx)
                        .await?;
                }

                // cascade: once a step completes, every input of its
                // successor exists, so the successor's expected count
                // becomes known; a step with nothing left to do completes
                // immediately, possibly all the way down the chain
                let step_records = sqlx::query_as::<_, WorkflowStepRecord>(SELECT_ALL_STEPS)
                    .bind(item.job_id.0)
                    .fetch_all(&mut *tx)
                    .await?;
                let mut steps: Vec<WorkflowStep> = step_records
                    .into_iter()
                    .map(|r| r.try_into().map_err(RepoError::Conversion))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut prior_complete = true;
                for st in steps.iter_mut() {
                    if prior_complete && !st.is_complete {
                        let mut changed = false;
                        if st.expected_count.is_none() {
                            st.expected_count = Some(st.created_count);
                            changed = true;
                        }
                        if st.is_terminal(job.ignore_errors) {
                            st.is_complete = true;
                            changed = true;
                        }
                        if changed {
                            sqlx::query(UPDATE_STEP_COUNTS)
                                .bind(st.job_id.0)
                                .bind(st.step_index)
                                .bind(st.expected_count)
                                .bind(st.created_count)
                                .bind(st.successful_count)
                                .bind(st.failed_count)
                                .bind(st.is_complete)
                                .execute(&mut *tx)
                                .await?;
                        }
                    }
                    prior_complete = prior_complete && st.is_complete;
                }

                let all_complete = steps.iter().all(|s| s.is_complete);
                if all_complete && !job.status.is_terminal() {
                    let any_failed = steps.iter().any(|s| s.failed_count > 0);
                    let final_step = steps.last().expect("job has at least one step");
                    let rows: Vec<(Option<String>,)> = sqlx::query_as(SELECT_STEP_OUTPUTS)
                        .bind(item.job_id.0)
                        .bind(final_step.step_index)
                        .fetch_all(&mut *tx)
                        .await?;
                    for (raw,) in rows {
                        if let Some(raw) = raw {
                            let list: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
                                RepoError::Conversion(format!("Invalid work item results: {e}"))
                            })?;
                            for href in list {
                                // permalinks require the public object prefix
                                if is_publicly_linkable(&href) {
                                    job.links.push(JobLink::data(href, None));
                                } else {
                                    warn!(
                                        job = %job.id,
                                        href = %href,
                                        "Dropping result outside the public prefix from job links"
                                    );
                                }
                            }
                        }
                    }

                    let new_status = if any_failed {
                        JobStatus::CompleteWithErrors
                    } else {
                        JobStatus::Successful
                    };
                    let message = job.message_for(new_status, None);
                    job = job.with_status(new_status, message);
                    job.progress = 100;
                    sqlx::query(UPDATE_JOB_STATUS)
                        .bind(job.id.0)
                        .bind(job.status.to_string())
                        .bind(&job.message)
                        .bind(serde_json::to_string(&job.messages).unwrap())
                        .bind(job.progress)
                        .bind(serde_json::to_string(&job.links).unwrap())
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(DELETE_USER_WORK)
                        .bind(job.id.0)
                        .execute(&mut *tx)
                        .await?;
                } else {
                    let progress = compute_progress(&steps);
                    if progress != job.progress {
                        job.progress = progress;
                        sqlx::query(UPDATE_JOB_PROGRESS)
                            .bind(job.id.0)
                            .bind(progress)
                            .bind(now)
                            .execute(&mut *tx)
                            .await?;
                    }
                }

                tx.commit().await?;
                Ok(CompletionOutcome {
                    job,
                    item_status: final_status,
                    requeued: false,
                })
            }

            async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, JobStoreError> {
                let record = sqlx::query_as::<_, WorkItemRecord>(select_item_sql!())
                    .bind(id.0)
                    .fetch_optional(&*self.db_pool)
                    .await?;
                match record {
                    None => Ok(None),
                    Some(record) => Ok(Some(
                        record
                            .try_into()
                            .map_err(RepoError::Conversion)
                            .map_err(JobStoreError::Repo)?,
                    )),
                }
            }

            async fn items_for_step(
                &self,
                job_id: &JobId,
                step_index: i32,
            ) -> Result<Vec<WorkItem>, JobStoreError> {
                let records = sqlx::query_as::<_, WorkItemRecord>(ITEMS_FOR_STEP)
                    .bind(job_id.0)
                    .bind(step_index)
                    .fetch_all(&*self.db_pool)
                    .await?;
                records
                    .into_iter()
                    .map(|r| r.try_into().map_err(RepoError::Conversion))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(JobStoreError::Repo)
            }

            async fn user_work_for(&self, job_id: &JobId) -> Result<Vec<UserWork>, JobStoreError> {
                let records = sqlx::query_as::<_, UserWorkRecord>(USER_WORK_FOR_JOB)
                    .bind(job_id.0)
                    .fetch_all(&*self.db_pool)
                    .await?;
                Ok(records.into_iter().map(UserWork::from).collect())
            }

            async fn ready_count(&self, service_id: &ServiceId) -> Result<i64, JobStoreError> {
                let (count,): (i64,) = sqlx::query_as(READY_COUNT)
                    .bind(&service_id.0)
                    .fetch_one(&*self.db_pool)
                    .await?;
                Ok(count)
            }
        }
    };
}

work_repo_impl!(
    sqlx::Postgres,
    claim_candidate_sql!(" FOR UPDATE OF w SKIP LOCKED"),
    select_item_sql!(" FOR UPDATE"),
    select_job_sql!(" FOR UPDATE")
);

// SQLite has a single writer, so the explicit row locks of the Postgres
// variant are unnecessary.
work_repo_impl!(
    sqlx::Sqlite,
    claim_candidate_sql!(),
    select_item_sql!(),
    select_job_sql!()
);

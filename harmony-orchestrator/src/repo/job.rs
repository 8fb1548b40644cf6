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

use crate::model::{Job, NewWorkItem, UserWork, WorkflowStep};
use crate::repo::{JobRecord, JobStoreError, RepoError, WorkflowStepRecord};
use async_trait::async_trait;
use chrono::Utc;
use harmony_common::model::{JobId, JobStatus, ProviderId, WorkItemStatus};
use sqlx::{Database, Pool};
use std::sync::Arc;

const SELECT_JOB: &str = "SELECT id, request_id, username, status, message, messages, progress, \
     request_url, is_async, num_input_granules, collection_ids, ignore_errors, destination_url, \
     service_name, provider_id, links, created_at, updated_at FROM jobs WHERE id = $1";

const SELECT_STEPS: &str = "SELECT job_id, step_index, service_id, operation, expected_count, \
     created_count, successful_count, failed_count, is_aggregated, is_batched, is_sequential, \
     max_batch_inputs, max_batch_size_bytes, progress_weight, is_complete \
     FROM workflow_steps WHERE job_id = $1 ORDER BY step_index";

const SELECT_JOB_LABELS: &str = "SELECT l.value FROM labels l \
     JOIN jobs_labels jl ON jl.label_id = l.id WHERE jl.job_id = $1 ORDER BY l.value";

const INSERT_JOB: &str = "INSERT INTO jobs \
     (id, request_id, username, status, message, messages, progress, request_url, is_async, \
      num_input_granules, collection_ids, ignore_errors, destination_url, service_name, \
      provider_id, links, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)";

const INSERT_STEP: &str = "INSERT INTO workflow_steps \
     (job_id, step_index, service_id, operation, expected_count, created_count, \
      successful_count, failed_count, is_aggregated, is_batched, is_sequential, \
      max_batch_inputs, max_batch_size_bytes, progress_weight, is_complete) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)";

const INSERT_WORK_ITEM: &str = "INSERT INTO work_items \
     (job_id, service_id, step_index, status, scroll_id, stac_catalog_locations, sort_index, \
      created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const INSERT_USER_WORK: &str = "INSERT INTO user_work \
     (job_id, service_id, username, ready_count, running_count, is_async, last_worked) \
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

const UPDATE_JOB_STATUS: &str = "UPDATE jobs SET status = $2, message = $3, messages = $4, \
     progress = $5, updated_at = $6 WHERE id = $1";

const CANCEL_JOB_ITEMS: &str = "UPDATE work_items SET status = 'canceled', updated_at = $2 \
     WHERE job_id = $1 AND status IN ('ready', 'queued', 'running')";

const DELETE_USER_WORK: &str = "DELETE FROM user_work WHERE job_id = $1";

const SELECT_PROVIDER: &str = "SELECT provider_id FROM jobs WHERE id = $1";

const INSERT_LABEL: &str = "INSERT INTO labels (username, value, created_at) \
     VALUES ($1, $2, $3) ON CONFLICT (username, value) DO NOTHING";

const SELECT_LABEL_ID: &str = "SELECT id FROM labels WHERE username = $1 AND value = $2";

const DELETE_JOB_LABELS: &str = "DELETE FROM jobs_labels WHERE job_id = $1";

const INSERT_JOB_LABEL: &str = "INSERT INTO jobs_labels (job_id, label_id) VALUES ($1, $2)";

/// Lowercased, trimmed, de-duplicated label values in input order.
pub fn normalize_labels(labels: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    labels
        .iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty() && seen.insert(l.clone()))
        .collect()
}

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Persists a job with its workflow steps, its fair-scheduling rows and
    /// the first step's work items in one transaction. Any conflict rolls
    /// the whole bundle back.
    async fn create_job_bundle(
        &self,
        job: &Job,
        steps: &[WorkflowStep],
        user_work: &[UserWork],
        first_step_items: &[NewWorkItem],
    ) -> Result<(), JobStoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError>;

    async fn get_steps(&self, id: &JobId) -> Result<Vec<WorkflowStep>, JobStoreError>;

    /// Applies a status transition, rejecting any move the status machine
    /// does not allow. A terminal transition removes the job's user_work
    /// rows.
    async fn transition_job(
        &self,
        id: &JobId,
        new_status: JobStatus,
        message: Option<String>,
    ) -> Result<Job, JobStoreError>;

    /// Cancels the job and sweeps all of its non-terminal work items to
    /// canceled within the same transaction.
    async fn cancel_job(&self, id: &JobId, message: Option<String>) -> Result<Job, JobStoreError>;

    /// Replaces the job's label set; values are de-duplicated per username
    /// and lowercased. Returns the normalized set.
    async fn set_labels_for_job(
        &self,
        id: &JobId,
        username: &str,
        labels: &[String],
    ) -> Result<Vec<String>, JobStoreError>;

    async fn provider_of(&self, id: &JobId) -> Result<ProviderId, JobStoreError>;
}

pub struct DbJobRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbJobRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

macro_rules! job_repo_impl {
    ($db:ty, $select_for_update:expr) => {
        #[async_trait]
        impl JobRepo for DbJobRepo<$db> {
            async fn create_job_bundle(
                &self,
                job: &Job,
                steps: &[WorkflowStep],
                user_work: &[UserWork],
                first_step_items: &[NewWorkItem],
            ) -> Result<(), JobStoreError> {
                let mut tx = self.db_pool.begin().await?;
                let record = JobRecord::from(job);

                sqlx::query(INSERT_JOB)
                    .bind(record.id)
                    .bind(record.request_id)
                    .bind(&record.username)
                    .bind(&record.status)
                    .bind(&record.message)
                    .bind(&record.messages)
                    .bind(record.progress)
                    .bind(&record.request_url)
                    .bind(record.is_async)
                    .bind(record.num_input_granules)
                    .bind(&record.collection_ids)
                    .bind(record.ignore_errors)
                    .bind(&record.destination_url)
                    .bind(&record.service_name)
                    .bind(&record.provider_id)
                    .bind(&record.links)
                    .bind(record.created_at)
                    .bind(record.updated_at)
                    .execute(&mut *tx)
                    .await?;

                for step in steps {
                    sqlx::query(INSERT_STEP)
                        .bind(step.job_id.0)
                        .bind(step.step_index)
                        .bind(&step.service_id.0)
                        .bind(serde_json::to_string(&step.operation).unwrap())
                        .bind(step.expected_count)
                        .bind(step.created_count)
                        .bind(step.successful_count)
                        .bind(step.failed_count)
                        .bind(step.is_aggregated)
                        .bind(step.is_batched)
                        .bind(step.is_sequential)
                        .bind(step.max_batch_inputs)
                        .bind(step.max_batch_size_bytes)
                        .bind(step.progress_weight)
                        .bind(step.is_complete)
                        .execute(&mut *tx)
                        .await?;
                }

                let now = Utc::now();
                for item in first_step_items {
                    sqlx::query(INSERT_WORK_ITEM)
                        .bind(item.job_id.0)
                        .bind(&item.service_id.0)
                        .bind(item.step_index)
                        .bind(WorkItemStatus::Ready.to_string())
                        .bind(&item.scroll_id)
                        .bind(if item.stac_catalog_locations.is_empty() {
                            None
                        } else {
                            Some(serde_json::to_string(&item.stac_catalog_locations).unwrap())
                        })
                        .bind(item.sort_index)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                }

                for row in user_work {
                    sqlx::query(INSERT_USER_WORK)
                        .bind(row.job_id.0)
                        .bind(&row.service_id.0)
                        .bind(&row.username)
                        .bind(row.ready_count)
                        .bind(row.running_count)
                        .bind(row.is_async)
                        .bind(row.last_worked)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(())
            }

            async fn get(&self, id: &JobId) -> Result<Option<Job>, JobStoreError> {
                let record = sqlx::query_as::<_, JobRecord>(SELECT_JOB)
                    .bind(id.0)
                    .fetch_optional(&*self.db_pool)
                    .await?;
                match record {
                    None => Ok(None),
                    Some(record) => {
                        let mut job: Job =
                            record.try_into().map_err(RepoError::Conversion)?;
                        let labels: Vec<(String,)> = sqlx::query_as(SELECT_JOB_LABELS)
                            .bind(id.0)
                            .fetch_all(&*self.db_pool)
                            .await?;
                        job.labels = labels.into_iter().map(|(value,)| value).collect();
                        Ok(Some(job))
                    }
                }
            }

            async fn get_steps(&self, id: &JobId) -> Result<Vec<WorkflowStep>, JobStoreError> {
                let records = sqlx::query_as::<_, WorkflowStepRecord>(SELECT_STEPS)
                    .bind(id.0)
                    .fetch_all(&*self.db_pool)
                    .await?;
                records
                    .into_iter()
                    .map(|r| r.try_into().map_err(RepoError::Conversion))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(JobStoreError::Repo)
            }

            async fn transition_job(
                &self,
                id: &JobId,
                new_status: JobStatus,
                message: Option<String>,
            ) -> Result<Job, JobStoreError> {
                let mut tx = self.db_pool.begin().await?;

                let record = sqlx::query_as::<_, JobRecord>($select_for_update)
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::JobNotFound(*id))?;
                let job: Job = record.try_into().map_err(RepoError::Conversion)?;

                if !job.status.can_transition_to(new_status) {
                    return Err(JobStoreError::InvalidTransition {
                        from: job.status,
                        to: new_status,
                    });
                }

                let message = job.message_for(new_status, message.as_deref());
                let progress = if matches!(
                    new_status,
                    JobStatus::Successful | JobStatus::CompleteWithErrors
                ) {
                    100
                } else {
                    job.progress
                };
                let updated = job.clone().with_status(new_status, message);

                sqlx::query(UPDATE_JOB_STATUS)
                    .bind(id.0)
                    .bind(updated.status.to_string())
                    .bind(&updated.message)
                    .bind(serde_json::to_string(&updated.messages).unwrap())
                    .bind(progress)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await?;

                if new_status.is_terminal() {
                    sqlx::query(DELETE_USER_WORK)
                        .bind(id.0)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(Job {
                    progress,
                    ..updated
                })
            }

            async fn cancel_job(
                &self,
                id: &JobId,
                message: Option<String>,
            ) -> Result<Job, JobStoreError> {
                let mut tx = self.db_pool.begin().await?;

                let record = sqlx::query_as::<_, JobRecord>($select_for_update)
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::JobNotFound(*id))?;
                let job: Job = record.try_into().map_err(RepoError::Conversion)?;

                if !job.status.can_transition_to(JobStatus::Canceled) {
                    return Err(JobStoreError::InvalidTransition {
                        from: job.status,
                        to: JobStatus::Canceled,
                    });
                }

                let message = job.message_for(JobStatus::Canceled, message.as_deref());
                let updated = job.clone().with_status(JobStatus::Canceled, message);
                let now = Utc::now();

                sqlx::query(UPDATE_JOB_STATUS)
                    .bind(id.0)
                    .bind(updated.status.to_string())
                    .bind(&updated.message)
                    .bind(serde_json::to_string(&updated.messages).unwrap())
                    .bind(updated.progress)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                sqlx::query(CANCEL_JOB_ITEMS)
                    .bind(id.0)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                sqlx::query(DELETE_USER_WORK)
                    .bind(id.0)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(updated)
            }

            async fn set_labels_for_job(
                &self,
                id: &JobId,
                username: &str,
                labels: &[String],
            ) -> Result<Vec<String>, JobStoreError> {
                let normalized = normalize_labels(labels);
                let mut tx = self.db_pool.begin().await?;

                sqlx::query(SELECT_PROVIDER)
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(JobStoreError::JobNotFound(*id))?;

                let now = Utc::now();
                let mut label_ids: Vec<i64> = Vec::with_capacity(normalized.len());
                for value in &normalized {
                    sqlx::query(INSERT_LABEL)
                        .bind(username)
                        .bind(value)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    let (label_id,): (i64,) = sqlx::query_as(SELECT_LABEL_ID)
                        .bind(username)
                        .bind(value)
                        .fetch_one(&mut *tx)
                        .await?;
                    label_ids.push(label_id);
                }

                sqlx::query(DELETE_JOB_LABELS)
                    .bind(id.0)
                    .execute(&mut *tx)
                    .await?;
                for label_id in label_ids {
                    sqlx::query(INSERT_JOB_LABEL)
                        .bind(id.0)
                        .bind(label_id)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(normalized)
            }

            async fn provider_of(&self, id: &JobId) -> Result<ProviderId, JobStoreError> {
                let row: Option<(String,)> = sqlx::query_as(SELECT_PROVIDER)
                    .bind(id.0)
                    .fetch_optional(&*self.db_pool)
                    .await?;
                row.map(|(provider,)| ProviderId(provider))
                    .ok_or(JobStoreError::JobNotFound(*id))
            }
        }
    };
}

job_repo_impl!(
    sqlx::Postgres,
    "SELECT id, request_id, username, status, message, messages, progress, request_url, \
     is_async, num_input_granules, collection_ids, ignore_errors, destination_url, service_name, \
     provider_id, links, created_at, updated_at FROM jobs WHERE id = $1 FOR UPDATE"
);

// SQLite serializes writers, so the row lock the Postgres variant takes is
// implicit here.
job_repo_impl!(sqlx::Sqlite, SELECT_JOB);

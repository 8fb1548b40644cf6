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

//! End-to-end workflow tests over SQLite-backed repos: plan a job, pull work
//! like a pod would, report completions, and observe the job state machine.

use assert2::let_assert;
use chrono::{DateTime, Utc};
use harmony_common::config::DbSqliteConfig;
use harmony_common::model::{
    CollectionId, ErrorKind, JobId, JobStatus, ProviderId, RequestId, ServiceId,
    WorkItemCompletion, WorkItemId, WorkItemStatus,
};
use harmony_common::operation::{
    DataSource, OperationDocument, TemporalRange, Variable,
};
use harmony_orchestrator::db;
use harmony_orchestrator::model::{Job, JobMessage};
use harmony_orchestrator::planner::{self, PlanInputs};
use harmony_orchestrator::registry::{RequestContext, ServiceRegistry, BEST_EFFORT_WARNING};
use harmony_orchestrator::repo::job::{DbJobRepo, JobRepo};
use harmony_orchestrator::repo::work::{ClaimedWork, CompletionPolicy, DbWorkRepo, WorkRepo};
use harmony_orchestrator::repo::JobStoreError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const QUERY_CMR: &str = "harmonyservices/query-cmr:latest";
const SUBSETTER: &str = "harmonyservices/subsetter:latest";
const CONCATENATOR: &str = "harmonyservices/concatenator:latest";
const REFORMATTER: &str = "harmonyservices/reformatter:latest";

const CMR_ONLY_YAML: &str = r#"
services:
  - name: cmr-only
    data_operation_version: "0.22.0"
    all_collections: true
    capabilities:
      subsetting:
        temporal: true
    steps:
      - image: harmonyservices/query-cmr:latest
        is_sequential: true
"#;

const SUBSET_CHAIN_YAML: &str = r#"
services:
  - name: subsetter-chain
    data_operation_version: "0.22.0"
    all_collections: true
    capabilities:
      subsetting:
        bbox: true
        temporal: true
        variable: true
        multiple_variable: true
      output_formats: [image/tiff]
    steps:
      - image: harmonyservices/query-cmr:latest
        is_sequential: true
      - image: harmonyservices/subsetter:latest
        operations: [spatialSubset, variableSubset, reformat]
"#;

const CONCAT_CHAIN_YAML: &str = r#"
services:
  - name: concat-chain
    data_operation_version: "0.22.0"
    all_collections: true
    capabilities:
      subsetting:
        bbox: true
        variable: true
        multiple_variable: true
      output_formats: [image/tiff, application/x-netcdf4]
      concatenation: true
    steps:
      - image: harmonyservices/query-cmr:latest
        is_sequential: true
      - image: harmonyservices/subsetter:latest
        operations: [spatialSubset, variableSubset, reformat]
      - image: harmonyservices/concatenator:latest
        operations: [concatenate]
        is_batched: true
        max_batch_inputs: 2
        conditional:
          exists: [concatenate]
"#;

const BEST_EFFORT_YAML: &str = r#"
services:
  - name: reformatter-only
    data_operation_version: "0.22.0"
    all_collections: true
    capabilities:
      output_formats: [image/tiff]
    steps:
      - image: harmonyservices/query-cmr:latest
        is_sequential: true
      - image: harmonyservices/reformatter:latest
        operations: [reformat]
"#;

struct TestStore {
    job_repo: Arc<dyn JobRepo>,
    work_repo: Arc<dyn WorkRepo>,
    _dir: tempfile::TempDir,
}

async fn store() -> TestStore {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = DbSqliteConfig {
        database: dir
            .path()
            .join("harmony.sqlite")
            .to_string_lossy()
            .to_string(),
        max_connections: 5,
    };
    db::sqlite_migrate(&config).await.expect("migrations");
    let pool = Arc::new(db::create_sqlite_pool(&config).await.expect("pool"));
    TestStore {
        job_repo: Arc::new(DbJobRepo::new(pool.clone())),
        work_repo: Arc::new(DbWorkRepo::new(pool)),
        _dir: dir,
    }
}

fn policy() -> CompletionPolicy {
    CompletionPolicy { retry_cap: 3 }
}

fn temporal(start: &str, end: &str) -> TemporalRange {
    TemporalRange {
        start: Some(
            DateTime::parse_from_rfc3339(start)
                .unwrap()
                .with_timezone(&Utc),
        ),
        end: Some(
            DateTime::parse_from_rfc3339(end)
                .unwrap()
                .with_timezone(&Utc),
        ),
    }
}

fn operation() -> OperationDocument {
    OperationDocument::builder(RequestId::new_v4(), "jdoe", "harmony-test")
        .access_token("encrypted")
        .source(DataSource {
            collection: CollectionId("C1233800302-EEDTEST".to_string()),
            short_name: "harmony_example".to_string(),
            version_id: "1".to_string(),
            variables: vec![],
            coordinate_variables: vec![],
            granules: None,
        })
        .staging_location("s3://staging/public/req/")
        .build()
}

fn job_for(op: &OperationDocument, service_name: &str, ignore_errors: bool) -> Job {
    let now = Utc::now();
    let message = JobStatus::Accepted.default_message().to_string();
    Job {
        id: JobId::new_v4(),
        request_id: op.request_id,
        username: op.user.clone(),
        status: JobStatus::Accepted,
        message: message.clone(),
        messages: vec![JobMessage {
            status: JobStatus::Accepted,
            message,
        }],
        progress: 0,
        request_url: "https://harmony.example.com/C1233800302-EEDTEST/ogc-api-coverages"
            .to_string(),
        is_async: true,
        num_input_granules: 0,
        collection_ids: vec![CollectionId("C1233800302-EEDTEST".to_string())],
        ignore_errors,
        destination_url: None,
        service_name: service_name.to_string(),
        provider_id: ProviderId("EEDTEST".to_string()),
        links: vec![],
        labels: vec![],
        created_at: now,
        updated_at: now,
    }
}

async fn create_job(
    ts: &TestStore,
    registry: &ServiceRegistry,
    op: &OperationDocument,
    mut job: Job,
    granule_count: i32,
    page_size: i32,
) -> Job {
    job.num_input_granules = granule_count;
    let service = registry.find_by_name(&job.service_name).expect("service");
    let plan = planner::plan(&PlanInputs {
        job: &job,
        operation: op,
        service,
        registry,
        context: &RequestContext::default(),
        scroll_ids: &["cmr-scroll-1".to_string()],
        granule_count,
        page_size,
    })
    .expect("plan");
    ts.job_repo
        .create_job_bundle(&job, &plan.steps, &plan.user_work, &plan.initial_items)
        .await
        .expect("bundle");
    job
}

async fn claim(ts: &TestStore, service: &str) -> Option<ClaimedWork> {
    ts.work_repo
        .claim_next_work_item(&ServiceId(service.to_string()), "pod-1", 20)
        .await
        .expect("claim")
}

fn success(results: &[&str], scroll: Option<&str>, hits: Option<i64>) -> WorkItemCompletion {
    WorkItemCompletion {
        status: WorkItemStatus::Successful,
        results: results.iter().map(|r| r.to_string()).collect(),
        total_granules_size: results.len() as i64 * 10,
        output_item_sizes: results.iter().map(|_| 10).collect(),
        error: None,
        error_kind: None,
        scroll_id: scroll.map(str::to_string),
        hits,
    }
}

fn failure(kind: ErrorKind, error: &str) -> WorkItemCompletion {
    WorkItemCompletion {
        status: WorkItemStatus::Failed,
        results: vec![],
        total_granules_size: 0,
        output_item_sizes: vec![],
        error: Some(error.to_string()),
        error_kind: Some(kind),
        scroll_id: None,
        hits: None,
    }
}

/// The fair-scheduling rows must mirror the actual ready items at every
/// point.
async fn assert_ready_counts(ts: &TestStore, job_id: &JobId, step_count: i32) {
    let user_work = ts.work_repo.user_work_for(job_id).await.expect("user work");
    let mut ready_by_service: HashMap<String, i32> = HashMap::new();
    for step_index in 1..=step_count {
        for item in ts
            .work_repo
            .items_for_step(job_id, step_index)
            .await
            .expect("items")
        {
            if item.status == WorkItemStatus::Ready {
                *ready_by_service.entry(item.service_id.0.clone()).or_insert(0) += 1;
            }
        }
    }
    for row in &user_work {
        let actual = ready_by_service.get(&row.service_id.0).copied().unwrap_or(0);
        assert_eq!(
            row.ready_count, actual,
            "user_work.ready_count out of sync for {}",
            row.service_id
        );
    }
}

// The CMR-only chain: one sequential query step paged through a scroll
// session.
#[tokio::test]
async fn cmr_only_job_pages_through_the_session_and_links_all_catalogs() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.temporal = Some(temporal("2020-01-01T00:00:00Z", "2020-01-02T00:00:00Z"));

    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", false), 7, 3).await;

    // page 1
    let work = claim(&ts, QUERY_CMR).await.expect("first page");
    assert_eq!(work.item.scroll_id.as_deref(), Some("cmr-scroll-1"));
    assert_eq!(work.operation["sources"][0]["collection"], "C1233800302-EEDTEST");
    // the step is sequential: no second item while one runs
    assert!(claim(&ts, QUERY_CMR).await.is_none());
    // the first claim moved the job to running
    let running = ts.job_repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);

    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(&["s3://o/public/c1.json", "s3://o/public/c2.json", "s3://o/public/c3.json"], Some("cmr-scroll-1"), Some(7)),
            &policy(),
        )
        .await
        .unwrap();
    assert_ready_counts(&ts, &job.id, 1).await;

    // page 2
    let work = claim(&ts, QUERY_CMR).await.expect("second page");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(&["s3://o/public/c4.json", "s3://o/public/c5.json", "s3://o/public/c6.json"], Some("cmr-scroll-1"), None),
            &policy(),
        )
        .await
        .unwrap();

    // page 3 (last)
    let work = claim(&ts, QUERY_CMR).await.expect("third page");
    let outcome = ts
        .work_repo
        .complete_work_item(
            work.item.id,
            &success(&["s3://o/public/c7.json"], None, None),
            &policy(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.job.status, JobStatus::Successful);
    assert_eq!(outcome.job.progress, 100);
    assert_eq!(outcome.job.links.len(), 7);

    let items = ts.work_repo.items_for_step(&job.id, 1).await.unwrap();
    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.status == WorkItemStatus::Successful));

    // user_work rows are removed on finalization
    assert!(ts.work_repo.user_work_for(&job.id).await.unwrap().is_empty());
    assert!(claim(&ts, QUERY_CMR).await.is_none());
}

// Subset + reformat over a two-step chain.
#[tokio::test]
async fn subset_and_reformat_runs_one_item_per_granule() {
    let ts = store().await;
    let registry = ServiceRegistry::load(SUBSET_CHAIN_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.subset.bbox = Some([-130.0, -45.0, 130.0, 45.0]);
    op.format.mime = Some("image/tiff".to_string());
    op.sources[0].variables.push(Variable {
        id: "V1233801695-EEDTEST".to_string(),
        name: "alpha_var".to_string(),
        full_path: "/alpha_var".to_string(),
    });

    let job = create_job(
        &ts,
        &registry,
        &op,
        job_for(&op, "subsetter-chain", false),
        4,
        2000,
    )
    .await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(
                &["s3://o/g1.json", "s3://o/g2.json", "s3://o/g3.json", "s3://o/g4.json"],
                None,
                Some(4),
            ),
            &policy(),
        )
        .await
        .unwrap();
    assert_ready_counts(&ts, &job.id, 2).await;

    let step2 = ts.work_repo.items_for_step(&job.id, 2).await.unwrap();
    assert_eq!(step2.len(), 4);
    assert!(step2.iter().all(|i| i.scroll_id.is_none()));
    assert!(step2.iter().all(|i| i.stac_catalog_locations.len() == 1));

    for n in 1..=4 {
        let work = claim(&ts, SUBSETTER).await.expect("subset item");
        // the step operation was projected for the subsetter
        assert_eq!(work.operation["format"]["mime"], "image/tiff");
        let outcome = ts
            .work_repo
            .complete_work_item(
                work.item.id,
                &success(&[format!("s3://o/public/out{n}.json").as_str()], None, None),
                &policy(),
            )
            .await
            .unwrap();
        if n == 4 {
            assert_eq!(outcome.job.status, JobStatus::Successful);
            assert_eq!(outcome.job.links.len(), 4);
        } else {
            assert_eq!(outcome.job.status, JobStatus::Running);
            assert!(outcome.job.progress < 100);
        }
    }
}

// Concatenation: the final step is batched (max 2 inputs), so five subset
// outputs become three concat items.
#[tokio::test]
async fn concatenation_batches_outputs_two_by_two() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CONCAT_CHAIN_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.subset.bbox = Some([-130.0, -45.0, 130.0, 45.0]);
    op.format.mime = Some("application/x-netcdf4".to_string());
    op.concatenate = true;

    let job = create_job(
        &ts,
        &registry,
        &op,
        job_for(&op, "concat-chain", false),
        5,
        2000,
    )
    .await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(
                &[
                    "s3://o/g1.json",
                    "s3://o/g2.json",
                    "s3://o/g3.json",
                    "s3://o/g4.json",
                    "s3://o/g5.json",
                ],
                None,
                Some(5),
            ),
            &policy(),
        )
        .await
        .unwrap();

    let mut subset_outputs = Vec::new();
    for n in 1..=5 {
        let work = claim(&ts, SUBSETTER).await.expect("subset item");
        let output = format!("s3://o/sub{n}.json");
        subset_outputs.push(output.clone());
        ts.work_repo
            .complete_work_item(work.item.id, &success(&[output.as_str()], None, None), &policy())
            .await
            .unwrap();
    }

    let concat_items = ts.work_repo.items_for_step(&job.id, 3).await.unwrap();
    assert_eq!(concat_items.len(), 3);
    let mut input_sizes: Vec<usize> = concat_items
        .iter()
        .map(|i| i.stac_catalog_locations.len())
        .collect();
    input_sizes.sort_unstable();
    assert_eq!(input_sizes, vec![1, 2, 2]);
    // the union of batch inputs is exactly the set of subset outputs
    let union: HashSet<&String> = concat_items
        .iter()
        .flat_map(|i| i.stac_catalog_locations.iter())
        .collect();
    assert_eq!(union, subset_outputs.iter().collect());

    // only the final concatenation reports an output catalog
    for n in 1..=3 {
        let work = claim(&ts, CONCATENATOR).await.expect("concat item");
        let completion = if n == 3 {
            success(&["s3://o/public/concatenated.json"], None, None)
        } else {
            success(&[], None, None)
        };
        let outcome = ts
            .work_repo
            .complete_work_item(work.item.id, &completion, &policy())
            .await
            .unwrap();
        if n == 3 {
            assert_eq!(outcome.job.status, JobStatus::Successful);
            assert_eq!(outcome.job.links.len(), 1);
            assert_eq!(outcome.job.links[0].href, "s3://o/public/concatenated.json");
        }
    }
}

// ignore-errors: a failed item does not fail the job; it completes with
// errors once everything is terminal.
#[tokio::test]
async fn ignore_errors_collapses_to_complete_with_errors() {
    let ts = store().await;
    let registry = ServiceRegistry::load(SUBSET_CHAIN_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.subset.bbox = Some([-10.0, -10.0, 10.0, 10.0]);
    op.format.mime = Some("image/tiff".to_string());

    let job = create_job(
        &ts,
        &registry,
        &op,
        job_for(&op, "subsetter-chain", true),
        4,
        2000,
    )
    .await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(
                &["s3://o/g1.json", "s3://o/g2.json", "s3://o/g3.json", "s3://o/g4.json"],
                None,
                Some(4),
            ),
            &policy(),
        )
        .await
        .unwrap();

    let mut last = None;
    for n in 1..=4 {
        let work = claim(&ts, SUBSETTER).await.expect("subset item");
        let completion = if n == 2 {
            failure(ErrorKind::ServiceReported, "no data found in granule")
        } else {
            success(&[format!("s3://o/public/out{n}.json").as_str()], None, None)
        };
        last = Some(
            ts.work_repo
                .complete_work_item(work.item.id, &completion, &policy())
                .await
                .unwrap(),
        );
    }

    let outcome = last.unwrap();
    assert_eq!(outcome.job.status, JobStatus::CompleteWithErrors);
    assert_eq!(outcome.job.links.len(), 3);
}

// Strict mode: the first non-retryable failure fails the job and cancels
// everything still in flight.
#[tokio::test]
async fn strict_failure_fails_the_job_and_cancels_in_flight_items() {
    let ts = store().await;
    let registry = ServiceRegistry::load(SUBSET_CHAIN_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.format.mime = Some("image/tiff".to_string());

    let job = create_job(
        &ts,
        &registry,
        &op,
        job_for(&op, "subsetter-chain", false),
        3,
        2000,
    )
    .await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(&["s3://o/g1.json", "s3://o/g2.json", "s3://o/g3.json"], None, None),
            &policy(),
        )
        .await
        .unwrap();

    let work = claim(&ts, SUBSETTER).await.expect("subset item");
    let outcome = ts
        .work_repo
        .complete_work_item(
            work.item.id,
            &failure(ErrorKind::Validation, "bad variable"),
            &policy(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.job.status, JobStatus::Failed);
    assert!(outcome.job.message.contains("bad variable"));

    let step2 = ts.work_repo.items_for_step(&job.id, 2).await.unwrap();
    assert_eq!(
        step2
            .iter()
            .filter(|i| i.status == WorkItemStatus::Failed)
            .count(),
        1
    );
    assert_eq!(
        step2
            .iter()
            .filter(|i| i.status == WorkItemStatus::Canceled)
            .count(),
        2
    );
    assert!(claim(&ts, SUBSETTER).await.is_none());
}

// Cancellation sweeps every non-terminal item in one transaction and no new
// work appears afterwards.
#[tokio::test]
async fn cancel_sweeps_remaining_items() {
    let ts = store().await;
    let registry = ServiceRegistry::load(SUBSET_CHAIN_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.format.mime = Some("image/tiff".to_string());

    let job = create_job(
        &ts,
        &registry,
        &op,
        job_for(&op, "subsetter-chain", false),
        4,
        2000,
    )
    .await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(
                &["s3://o/g1.json", "s3://o/g2.json", "s3://o/g3.json", "s3://o/g4.json"],
                None,
                None,
            ),
            &policy(),
        )
        .await
        .unwrap();

    for n in 1..=2 {
        let work = claim(&ts, SUBSETTER).await.expect("subset item");
        ts.work_repo
            .complete_work_item(
                work.item.id,
                &success(&[format!("s3://o/public/out{n}.json").as_str()], None, None),
                &policy(),
            )
            .await
            .unwrap();
    }

    let canceled = ts.job_repo.cancel_job(&job.id, None).await.unwrap();
    assert_eq!(canceled.status, JobStatus::Canceled);

    let step2 = ts.work_repo.items_for_step(&job.id, 2).await.unwrap();
    let statuses: Vec<WorkItemStatus> = step2.iter().map(|i| i.status).collect();
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == WorkItemStatus::Canceled)
            .count(),
        2
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == WorkItemStatus::Successful)
            .count(),
        2
    );

    // no further work and no user_work rows
    assert!(claim(&ts, SUBSETTER).await.is_none());
    assert!(ts.work_repo.user_work_for(&job.id).await.unwrap().is_empty());

    // a late completion report for a swept item changes nothing
    let swept = step2
        .iter()
        .find(|i| i.status == WorkItemStatus::Canceled)
        .unwrap();
    let_assert!(
        Err(JobStoreError::WorkItemAlreadyTerminal(_)) = ts
            .work_repo
            .complete_work_item(swept.id, &success(&["s3://late.json"], None, None), &policy())
            .await
    );
    let unchanged = ts.work_repo.get(swept.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, WorkItemStatus::Canceled);
    assert!(unchanged.results.is_empty());

    // terminal statuses are absorbing
    let_assert!(
        Err(JobStoreError::InvalidTransition { .. }) = ts
            .job_repo
            .transition_job(&job.id, JobStatus::Running, None)
            .await
    );
}

// A second completion for an item that already finished is a conflict and
// must not change state.
#[tokio::test]
async fn completions_are_at_most_once() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let op = operation();
    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", false), 1, 3).await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(work.item.id, &success(&["s3://o/public/c1.json"], None, None), &policy())
        .await
        .unwrap();

    let_assert!(
        Err(JobStoreError::WorkItemAlreadyTerminal(id)) = ts
            .work_repo
            .complete_work_item(work.item.id, &success(&["s3://other.json"], None, None), &policy())
            .await
    );
    assert_eq!(id, work.item.id);

    let item = ts.work_repo.get(work.item.id).await.unwrap().unwrap();
    assert_eq!(item.results, vec!["s3://o/public/c1.json".to_string()]);

    let job = ts.job_repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Successful);
    assert_eq!(job.links.len(), 1);
}

// Transient failures are requeued with a retry count until the cap, then
// fail the item.
#[tokio::test]
async fn transient_failures_requeue_until_the_retry_cap() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let op = operation();
    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", true), 1, 3).await;

    let mut item_id: Option<WorkItemId> = None;
    for attempt in 0..3 {
        let work = claim(&ts, QUERY_CMR).await.expect("query item");
        assert_eq!(work.item.retry_count, attempt);
        item_id = Some(work.item.id);
        let outcome = ts
            .work_repo
            .complete_work_item(
                work.item.id,
                &failure(ErrorKind::TransientInfrastructure, "connection reset"),
                &policy(),
            )
            .await
            .unwrap();
        assert!(outcome.requeued);
        assert_ready_counts(&ts, &job.id, 1).await;
    }

    // the fourth failure exhausts the cap
    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    assert_eq!(work.item.id, item_id.unwrap());
    assert_eq!(work.item.retry_count, 3);
    let outcome = ts
        .work_repo
        .complete_work_item(
            work.item.id,
            &failure(ErrorKind::Timeout, "invocation timed out"),
            &policy(),
        )
        .await
        .unwrap();
    assert!(!outcome.requeued);
    assert_eq!(outcome.item_status, WorkItemStatus::Failed);
    assert_eq!(outcome.job.status, JobStatus::CompleteWithErrors);
}

// Pausing stops claims without touching item state; resuming restores them.
#[tokio::test]
async fn paused_jobs_hand_out_no_work() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let op = operation();
    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", false), 1, 3).await;

    // move accepted -> running -> paused
    ts.job_repo
        .transition_job(&job.id, JobStatus::Running, None)
        .await
        .unwrap();
    ts.job_repo
        .transition_job(&job.id, JobStatus::Paused, None)
        .await
        .unwrap();
    assert!(claim(&ts, QUERY_CMR).await.is_none());
    assert_ready_counts(&ts, &job.id, 1).await;

    ts.job_repo
        .transition_job(&job.id, JobStatus::Running, None)
        .await
        .unwrap();
    assert!(claim(&ts, QUERY_CMR).await.is_some());
}

// Per-user fairness: with two jobs queued for a service, claims alternate
// between them following last_worked.
#[tokio::test]
async fn claims_alternate_between_users() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();

    let op_a = operation();
    let job_a = create_job(&ts, &registry, &op_a, job_for(&op_a, "cmr-only", false), 6, 3).await;

    let mut op_b = operation();
    op_b.user = "other_user".to_string();
    let mut job_b = job_for(&op_b, "cmr-only", false);
    job_b.username = "other_user".to_string();
    let job_b = create_job(&ts, &registry, &op_b, job_b, 6, 3).await;

    let first = claim(&ts, QUERY_CMR).await.expect("first claim");
    let second = claim(&ts, QUERY_CMR).await.expect("second claim");
    assert_ne!(first.item.job_id, second.item.job_id);
    let claimed: HashSet<JobId> = [first.item.job_id, second.item.job_id].into();
    assert!(claimed.contains(&job_a.id) && claimed.contains(&job_b.id));
}

// Labels replace atomically, lowercased and de-duplicated.
#[tokio::test]
async fn labels_are_normalized_and_replaced() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let op = operation();
    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", false), 1, 3).await;

    let labels = ts
        .job_repo
        .set_labels_for_job(
            &job.id,
            "jdoe",
            &["Ocean".to_string(), "ocean".to_string(), "  SST ".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(labels, vec!["ocean".to_string(), "sst".to_string()]);

    let labels = ts
        .job_repo
        .set_labels_for_job(&job.id, "jdoe", &["reprocessed".to_string()])
        .await
        .unwrap();
    assert_eq!(labels, vec!["reprocessed".to_string()]);

    let loaded = ts.job_repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.labels, vec!["reprocessed".to_string()]);
}

#[tokio::test]
async fn provider_of_returns_the_collection_provider() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let op = operation();
    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", false), 1, 3).await;

    let provider = ts.job_repo.provider_of(&job.id).await.unwrap();
    assert_eq!(provider, ProviderId("EEDTEST".to_string()));
}

// Best effort: asking for a spatial subset nobody supports still matches
// the reformat-only service, tagged with the bounds warning.
#[tokio::test]
async fn best_effort_match_runs_to_success_with_a_warning() {
    let ts = store().await;
    let registry = ServiceRegistry::load(BEST_EFFORT_YAML, &HashMap::new(), 10000).unwrap();
    let mut op = operation();
    op.subset.bbox = Some([-130.0, -45.0, 130.0, 45.0]);
    op.format.mime = Some("image/tiff".to_string());

    let chosen = registry.choose(&op, &RequestContext::default()).unwrap();
    assert_eq!(chosen.config.name, "reformatter-only");
    assert_eq!(chosen.warning.as_deref(), Some(BEST_EFFORT_WARNING));

    let mut job = job_for(&op, "reformatter-only", false);
    job.message = BEST_EFFORT_WARNING.to_string();
    job.messages[0].message = BEST_EFFORT_WARNING.to_string();
    let job = create_job(&ts, &registry, &op, job, 2, 2000).await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    ts.work_repo
        .complete_work_item(
            work.item.id,
            &success(&["s3://o/g1.json", "s3://o/g2.json"], None, None),
            &policy(),
        )
        .await
        .unwrap();

    for n in 1..=2 {
        let work = claim(&ts, REFORMATTER).await.expect("reformat item");
        let outcome = ts
            .work_repo
            .complete_work_item(
                work.item.id,
                &success(&[format!("s3://o/public/ref{n}.json").as_str()], None, None),
                &policy(),
            )
            .await
            .unwrap();
        if n == 2 {
            assert_eq!(outcome.job.status, JobStatus::Successful);
        }
    }

    let finished = ts.job_repo.get(&job.id).await.unwrap().unwrap();
    assert!(finished
        .messages
        .iter()
        .any(|m| m.message == BEST_EFFORT_WARNING));
}

// Permalink precondition: only results under the public object prefix may
// surface as job links.
#[tokio::test]
async fn results_outside_the_public_prefix_are_never_linked() {
    let ts = store().await;
    let registry = ServiceRegistry::load(CMR_ONLY_YAML, &HashMap::new(), 10000).unwrap();
    let op = operation();
    let job = create_job(&ts, &registry, &op, job_for(&op, "cmr-only", false), 3, 3).await;

    let work = claim(&ts, QUERY_CMR).await.expect("query item");
    let outcome = ts
        .work_repo
        .complete_work_item(
            work.item.id,
            &success(
                &[
                    "s3://o/public/ok.json",
                    "s3://o/private/leak.json",
                    "https://example.com/not-even-s3.json",
                ],
                None,
                Some(3),
            ),
            &policy(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.job.status, JobStatus::Successful);
    assert_eq!(outcome.job.links.len(), 1);
    assert_eq!(outcome.job.links[0].href, "s3://o/public/ok.json");

    // the item itself still records everything the service reported
    let item = ts.work_repo.get(work.item.id).await.unwrap().unwrap();
    assert_eq!(item.results.len(), 3);

    let loaded = ts.job_repo.get(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.links.len(), 1);
}

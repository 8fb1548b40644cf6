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

//! Expands a matched service chain into workflow steps and the initial work
//! items. Planning is eager: every step row and the fair-scheduling rows are
//! materialized at job start. Items beyond the first step are materialized
//! by the work coordinator as the previous step's outputs arrive.

use crate::model::{Job, NewWorkItem, UserWork, WorkflowStep};
use crate::registry::{RequestContext, ServiceConfig, ServiceRegistry, ServiceStep};
use chrono::Utc;
use harmony_common::model::ServiceId;
use harmony_common::operation::{
    AveragingKind, OperationDocument, OperationSchemaError, StepOperation,
};

/// The CMR query step is cheap relative to transformation steps.
const QUERY_STEP_PROGRESS_WEIGHT: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("No workflow steps apply to this request")]
    NoApplicableSteps,
    #[error(transparent)]
    Schema(#[from] OperationSchemaError),
}

pub struct PlanInputs<'a> {
    pub job: &'a Job,
    pub operation: &'a OperationDocument,
    pub service: &'a ServiceConfig,
    pub registry: &'a ServiceRegistry,
    pub context: &'a RequestContext,
    /// One CMR scroll session per entry; usually a single session.
    pub scroll_ids: &'a [String],
    /// Granule hits, already clamped to the applicable granule limit.
    pub granule_count: i32,
    pub page_size: i32,
}

pub struct JobPlan {
    pub steps: Vec<WorkflowStep>,
    pub initial_items: Vec<NewWorkItem>,
    pub user_work: Vec<UserWork>,
}

/// Does the operation ask for this step operation at all? Used by the
/// `exists` predicates of conditional steps.
fn operation_exists(op: &OperationDocument, step_op: StepOperation) -> bool {
    match step_op {
        StepOperation::VariableSubset => op.requires_variable_subset(),
        StepOperation::SpatialSubset => op.requires_spatial_subset(),
        StepOperation::ShapefileSubset => op.requires_shape_subset(),
        StepOperation::DimensionSubset => op.requires_dimension_subset(),
        StepOperation::TemporalSubset => op.requires_temporal_subset(),
        StepOperation::Reproject => op.requires_reprojection(),
        StepOperation::Reformat => op.format.mime.is_some(),
        StepOperation::Concatenate => op.concatenate,
        StepOperation::Extend => op.requires_extend(),
        StepOperation::TimeAveraging => op.average == Some(AveragingKind::Time),
        StepOperation::AreaAveraging => op.average == Some(AveragingKind::Area),
    }
}

/// All predicates of the step must pass. A step predicated on both extend
/// and concatenate is excluded when the user explicitly disabled extension
/// but asked for concatenation.
fn step_applies(op: &OperationDocument, context: &RequestContext, step: &ServiceStep) -> bool {
    let Some(condition) = &step.conditional else {
        return true;
    };

    let depends_on_extend = condition.exists.contains(&StepOperation::Extend);
    let depends_on_concatenate = condition.exists.contains(&StepOperation::Concatenate);
    if depends_on_extend
        && depends_on_concatenate
        && op.extend_explicitly_disabled()
        && op.concatenate
    {
        return false;
    }

    if !condition
        .exists
        .iter()
        .all(|step_op| operation_exists(op, *step_op))
    {
        return false;
    }

    if !condition.format.is_empty() {
        match &op.format.mime {
            Some(mime) => {
                if !condition.format.iter().any(|f| f.eq_ignore_ascii_case(mime)) {
                    return false;
                }
            }
            None => return false,
        }
    }

    if !condition.umm_c_native_format.is_empty() {
        let any_native_matches = op.sources.iter().any(|source| {
            context
                .collection_native_formats
                .get(&source.collection.0)
                .map(|native| condition.umm_c_native_format.contains(native))
                .unwrap_or(false)
        });
        if !any_native_matches {
            return false;
        }
    }

    true
}

/// The operation document a step's service receives: projected to the
/// step's declared operations and rendered at the chain's schema version.
/// A step without declared operations (the query step) receives the full
/// document.
fn step_operation_value(
    op: &OperationDocument,
    service: &ServiceConfig,
    step: &ServiceStep,
) -> Result<serde_json::Value, OperationSchemaError> {
    let projected = if step.operations.is_empty() {
        op.clone()
    } else {
        let capabilities: Vec<_> = step
            .operations
            .iter()
            .filter_map(|o| o.capability())
            .collect();
        op.project(&capabilities)
    };
    projected.to_versioned_value(&service.data_operation_version)
}

pub fn plan(inputs: &PlanInputs<'_>) -> Result<JobPlan, PlanError> {
    let PlanInputs {
        job,
        operation,
        service,
        registry,
        context,
        scroll_ids,
        granule_count,
        page_size,
    } = inputs;

    let applicable: Vec<&ServiceStep> = service
        .steps
        .iter()
        .filter(|step| step_applies(operation, context, step))
        .collect();
    if applicable.is_empty() {
        return Err(PlanError::NoApplicableSteps);
    }

    let expected_query_items = {
        let d = granule_count / *page_size;
        let r = granule_count % *page_size;
        if (r > 0 && *page_size > 0) || (r < 0 && *page_size < 0) {
            d + 1
        } else {
            d
        }
    }
    .max(1);

    let mut steps = Vec::with_capacity(applicable.len());
    for (i, step) in applicable.iter().enumerate() {
        let step_index = (i + 1) as i32;
        let is_first = i == 0;
        let image = registry.image_for(step);

        let (expected_count, created_count) = if is_first {
            if step.is_query_step() {
                (Some(expected_query_items), scroll_ids.len() as i32)
            } else {
                (Some(1), 1)
            }
        } else {
            (None, 0)
        };

        steps.push(WorkflowStep {
            job_id: job.id,
            step_index,
            service_id: ServiceId(image),
            operation: step_operation_value(operation, service, step)?,
            expected_count,
            created_count,
            successful_count: 0,
            failed_count: 0,
            is_aggregated: step.operations.iter().any(|o| o.is_multi_catalog()),
            is_batched: step.is_batched,
            is_sequential: step.is_sequential,
            max_batch_inputs: step.max_batch_inputs,
            max_batch_size_bytes: step.max_batch_size_in_bytes,
            progress_weight: if step.is_query_step() {
                QUERY_STEP_PROGRESS_WEIGHT
            } else {
                1.0
            },
            is_complete: false,
        });
    }

    let first = &steps[0];
    let initial_items: Vec<NewWorkItem> = if applicable[0].is_query_step() {
        scroll_ids
            .iter()
            .enumerate()
            .map(|(i, scroll_id)| NewWorkItem {
                job_id: job.id,
                service_id: first.service_id.clone(),
                step_index: 1,
                scroll_id: Some(scroll_id.clone()),
                stac_catalog_locations: vec![],
                sort_index: i as i64,
            })
            .collect()
    } else {
        vec![NewWorkItem {
            job_id: job.id,
            service_id: first.service_id.clone(),
            step_index: 1,
            scroll_id: None,
            stac_catalog_locations: vec![],
            sort_index: 0,
        }]
    };

    let now = Utc::now();
    let mut user_work: Vec<UserWork> = Vec::new();
    for step in &steps {
        if user_work.iter().any(|uw| uw.service_id == step.service_id) {
            continue;
        }
        let ready = initial_items
            .iter()
            .filter(|item| item.service_id == step.service_id)
            .count() as i32;
        user_work.push(UserWork {
            job_id: job.id,
            service_id: step.service_id.clone(),
            username: job.username.clone(),
            ready_count: ready,
            running_count: 0,
            is_async: job.is_async,
            last_worked: now,
        });
    }

    Ok(JobPlan {
        steps,
        initial_items,
        user_work,
    })
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use harmony_common::model::{
        CollectionId, JobId, JobStatus, ProviderId, RequestId,
    };
    use harmony_common::operation::DataSource;
    use std::collections::HashMap;

    const PLAN_YAML: &str = r#"
services:
  - name: chain
    data_operation_version: "0.22.0"
    all_collections: true
    capabilities:
      subsetting:
        bbox: true
        variable: true
      output_formats: [image/tiff]
      concatenation: true
      extend: true
    steps:
      - image: "harmonyservices/query-cmr:latest"
        is_sequential: true
      - image: "example/subsetter:1"
        operations: [spatialSubset, variableSubset, reformat]
      - image: "example/concat:1"
        operations: [concatenate]
        is_batched: true
        max_batch_inputs: 2
        conditional:
          exists: [concatenate]
      - image: "example/extender:1"
        operations: [extend, concatenate]
        conditional:
          exists: [extend, concatenate]
"#;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::load(PLAN_YAML, &HashMap::new(), 10000).unwrap()
    }

    fn job() -> Job {
        let id = JobId::new_v4();
        Job {
            id,
            request_id: RequestId::new_v4(),
            username: "jdoe".to_string(),
            status: JobStatus::Accepted,
            message: JobStatus::Accepted.default_message().to_string(),
            messages: vec![],
            progress: 0,
            request_url: "https://harmony.example.com/request".to_string(),
            is_async: true,
            num_input_granules: 7,
            collection_ids: vec![CollectionId("C1233800302-EEDTEST".to_string())],
            ignore_errors: false,
            destination_url: None,
            service_name: "chain".to_string(),
            provider_id: ProviderId("EEDTEST".to_string()),
            links: vec![],
            labels: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn operation(concatenate: bool) -> OperationDocument {
        OperationDocument::builder(RequestId::new_v4(), "jdoe", "harmony-test")
            .source(DataSource {
                collection: CollectionId("C1233800302-EEDTEST".to_string()),
                short_name: "harmony_example".to_string(),
                version_id: "1".to_string(),
                variables: vec![],
                coordinate_variables: vec![],
                granules: None,
            })
            .bbox([-130.0, -45.0, 130.0, 45.0])
            .output_mime("image/tiff")
            .concatenate(concatenate)
            .staging_location("s3://staging/public/x/")
            .build()
    }

    fn plan_for(op: &OperationDocument, granules: i32, page_size: i32) -> JobPlan {
        let registry = registry();
        let service = registry.find_by_name("chain").unwrap();
        let job = job();
        plan(&PlanInputs {
            job: &job,
            operation: op,
            service,
            registry: &registry,
            context: &RequestContext::default(),
            scroll_ids: &["session-1".to_string()],
            granule_count: granules,
            page_size,
        })
        .unwrap()
    }

    #[test]
    fn conditional_steps_are_filtered_by_the_operation() {
        let plan = plan_for(&operation(false), 7, 3);
        // concat and extend steps drop out
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].step_index, 1);
        assert_eq!(plan.steps[1].service_id.0, "example/subsetter:1");
    }

    #[test]
    fn concatenation_keeps_the_batched_step_and_marks_it_aggregated() {
        let plan = plan_for(&operation(true), 7, 3);
        assert_eq!(plan.steps.len(), 3);
        let concat = &plan.steps[2];
        assert!(concat.is_batched);
        assert!(concat.is_aggregated);
        assert_eq!(concat.max_batch_inputs, Some(2));
    }

    #[test]
    fn explicitly_disabled_extend_with_concatenate_excludes_the_extend_step() {
        let mut op = operation(true);
        op.extend_dimensions = Some(vec![]);
        let plan = plan_for(&op, 7, 3);
        assert!(plan
            .steps
            .iter()
            .all(|s| s.service_id.0 != "example/extender:1"));
    }

    #[test]
    fn query_step_expected_count_is_page_count() {
        let plan = plan_for(&operation(false), 7, 3);
        assert_eq!(plan.steps[0].expected_count, Some(3));
        assert_eq!(plan.steps[0].created_count, 1);
        assert_eq!(plan.steps[0].progress_weight, 0.1);
        assert_eq!(plan.steps[1].expected_count, None);
        assert_eq!(plan.initial_items.len(), 1);
        assert_eq!(plan.initial_items[0].scroll_id.as_deref(), Some("session-1"));
    }

    #[test]
    fn step_operations_are_projected() {
        let plan = plan_for(&operation(false), 7, 3);
        // the query step sees the full document
        assert!(plan.steps[0].operation.get("subset").is_some());
        let subsetter_op = &plan.steps[1].operation;
        assert_eq!(subsetter_op["format"]["mime"], "image/tiff");
        assert!(subsetter_op["subset"].get("bbox").is_some());
    }

    #[test]
    fn user_work_rows_cover_each_service_with_initial_ready_counts() {
        let plan = plan_for(&operation(true), 7, 3);
        assert_eq!(plan.user_work.len(), 3);
        let query = &plan.user_work[0];
        assert_eq!(query.ready_count, 1);
        assert!(plan.user_work[1..].iter().all(|uw| uw.ready_count == 0));
    }
}

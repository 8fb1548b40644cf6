use crate::api::{ApiError, ApiResult, ApiTags};
use crate::model::{DeploymentCallback, ServiceBacklog};
use crate::service::work::WorkCoordinator;
use harmony_common::model::{
    Empty, JobStatus, ServiceId, WorkForService, WorkItemCompletion, WorkItemId,
};
use poem_openapi::param::{Header, Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info_span, Instrument};

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[serde(rename_all = "camelCase")]
#[oai(rename_all = "camelCase")]
pub struct CompletionAck {
    /// Lets a pod discover that its job has moved on (e.g. was canceled)
    /// without an extra round trip.
    pub job_status: JobStatus,
}

pub struct ServiceWorkApi {
    pub work_coordinator: Arc<WorkCoordinator>,
}

#[OpenApi(prefix_path = "/service", tag = ApiTags::ServiceWork)]
impl ServiceWorkApi {
    /// Hand out one work item
    ///
    /// Returns the oldest ready work item for the service, honoring per-user
    /// fairness and the service's concurrency cap. 404 means nothing is
    /// ready; pods are expected to back off and poll again.
    #[oai(path = "/work", method = "get", operation_id = "get_work")]
    async fn get_work(
        &self,
        #[oai(name = "serviceID")] service_id: Query<String>,
        #[oai(name = "podName")] pod_name: Query<String>,
    ) -> ApiResult<Json<WorkForService>> {
        let span = info_span!("get_work", service = %service_id.0, pod = %pod_name.0);
        let work = self
            .work_coordinator
            .get_work(&ServiceId(service_id.0.clone()), &pod_name.0)
            .instrument(span)
            .await?;
        match work {
            Some(work) => Ok(Json(work)),
            None => Err(ApiError::not_found("no work available")),
        }
    }

    /// Report a work item result
    ///
    /// Accepts the completion payload for an item this pod was assigned.
    /// Reporting an item that is already terminal yields 409 and changes
    /// nothing; pods treat that as an instruction to discard their outputs.
    #[oai(path = "/work/:id", method = "put", operation_id = "complete_work")]
    async fn complete_work(
        &self,
        id: Path<i64>,
        payload: Json<WorkItemCompletion>,
    ) -> ApiResult<Json<CompletionAck>> {
        let span = info_span!("complete_work", item = id.0);
        let outcome = self
            .work_coordinator
            .complete_work(WorkItemId(id.0), &payload.0)
            .instrument(span)
            .await?;
        Ok(Json(CompletionAck {
            job_status: outcome.job.status,
        }))
    }

    /// Ready backlog for a service
    ///
    /// Used by the autoscaler to size worker pools.
    #[oai(path = "/metrics", method = "post", operation_id = "service_metrics")]
    async fn service_metrics(
        &self,
        #[oai(name = "serviceID")] service_id: Query<String>,
    ) -> ApiResult<Json<ServiceBacklog>> {
        let backlog = self
            .work_coordinator
            .backlog(&ServiceId(service_id.0.clone()))
            .await?;
        Ok(Json(backlog))
    }

    /// Deployment notification
    ///
    /// Refreshes the in-memory service image map. Guarded by the shared
    /// cookie secret.
    #[oai(
        path = "/deployment-callback",
        method = "post",
        operation_id = "deployment_callback"
    )]
    async fn deployment_callback(
        &self,
        #[oai(name = "cookie-secret")] secret: Header<String>,
        payload: Json<DeploymentCallback>,
    ) -> ApiResult<Json<Empty>> {
        self.work_coordinator
            .handle_deployment_callback(&secret.0, &payload.0)
            .map_err(|_| ApiError::unauthorized("bad deployment callback secret"))?;
        Ok(Json(Empty {}))
    }
}

use crate::api::{ApiResult, ApiTags, HarmonySecurityScheme};
use crate::clients::identity::IdentityClient;
use crate::model::{JobSummary, LabelsRequest};
use crate::service::jobs::JobService;
use harmony_common::model::JobId;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::OpenApi;
use std::sync::Arc;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub struct JobsApi {
    pub job_service: Arc<JobService>,
    pub identity: Arc<dyn IdentityClient>,
}

#[OpenApi(prefix_path = "/jobs", tag = ApiTags::Jobs)]
impl JobsApi {
    /// Get job status
    ///
    /// Returns status, progress, messages and the related links of one job.
    #[oai(path = "/:job_id", method = "get", operation_id = "get_job")]
    async fn get_job(
        &self,
        job_id: Path<Uuid>,
        token: HarmonySecurityScheme,
    ) -> ApiResult<Json<JobSummary>> {
        let span = info_span!("get_job", job = %job_id.0);
        let username = self.identity.validate_token(token.token()).await?;
        let job = self
            .job_service
            .get_job(&JobId(job_id.0), &username)
            .instrument(span)
            .await?;
        Ok(Json(JobSummary::from(&job)))
    }

    /// Cancel a job
    ///
    /// Cancels the job and all of its unfinished work in one transaction.
    #[oai(path = "/:job_id/cancel", method = "post", operation_id = "cancel_job")]
    async fn cancel_job(
        &self,
        job_id: Path<Uuid>,
        token: HarmonySecurityScheme,
    ) -> ApiResult<Json<JobSummary>> {
        let span = info_span!("cancel_job", job = %job_id.0);
        let username = self.identity.validate_token(token.token()).await?;
        let job = self
            .job_service
            .cancel_job(&JobId(job_id.0), &username)
            .instrument(span)
            .await?;
        Ok(Json(JobSummary::from(&job)))
    }

    /// Pause a job
    #[oai(path = "/:job_id/pause", method = "post", operation_id = "pause_job")]
    async fn pause_job(
        &self,
        job_id: Path<Uuid>,
        token: HarmonySecurityScheme,
    ) -> ApiResult<Json<JobSummary>> {
        let span = info_span!("pause_job", job = %job_id.0);
        let username = self.identity.validate_token(token.token()).await?;
        let job = self
            .job_service
            .pause_job(&JobId(job_id.0), &username)
            .instrument(span)
            .await?;
        Ok(Json(JobSummary::from(&job)))
    }

    /// Resume a paused job
    #[oai(path = "/:job_id/resume", method = "post", operation_id = "resume_job")]
    async fn resume_job(
        &self,
        job_id: Path<Uuid>,
        token: HarmonySecurityScheme,
    ) -> ApiResult<Json<JobSummary>> {
        let span = info_span!("resume_job", job = %job_id.0);
        let username = self.identity.validate_token(token.token()).await?;
        let job = self
            .job_service
            .resume_job(&JobId(job_id.0), &username)
            .instrument(span)
            .await?;
        Ok(Json(JobSummary::from(&job)))
    }

    /// Skip the preview phase
    ///
    /// Moves a previewing job straight to running.
    #[oai(
        path = "/:job_id/skip-preview",
        method = "post",
        operation_id = "skip_preview"
    )]
    async fn skip_preview(
        &self,
        job_id: Path<Uuid>,
        token: HarmonySecurityScheme,
    ) -> ApiResult<Json<JobSummary>> {
        let span = info_span!("skip_preview", job = %job_id.0);
        let username = self.identity.validate_token(token.token()).await?;
        let job = self
            .job_service
            .skip_preview(&JobId(job_id.0), &username)
            .instrument(span)
            .await?;
        Ok(Json(JobSummary::from(&job)))
    }

    /// Replace the job's labels
    ///
    /// Labels are de-duplicated per user and lowercased; the normalized set
    /// is returned.
    #[oai(path = "/:job_id/labels", method = "put", operation_id = "set_labels")]
    async fn set_labels(
        &self,
        job_id: Path<Uuid>,
        payload: Json<LabelsRequest>,
        token: HarmonySecurityScheme,
    ) -> ApiResult<Json<LabelsRequest>> {
        let span = info_span!("set_labels", job = %job_id.0);
        let username = self.identity.validate_token(token.token()).await?;
        let labels = self
            .job_service
            .set_labels(&JobId(job_id.0), &username, &payload.0.labels)
            .instrument(span)
            .await?;
        Ok(Json(LabelsRequest { labels }))
    }
}

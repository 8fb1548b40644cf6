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

use crate::clients::identity::IdentityError;
use crate::repo::JobStoreError;
use crate::service::jobs::JobServiceError;
use crate::service::Services;
use harmony_common::model::{ErrorBody, ErrorsBody};
use harmony_common::SafeDisplay;
use poem_openapi::auth::Bearer;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, OpenApiService, SecurityScheme, Tags};

mod healthcheck;
mod jobs;
mod work;

#[derive(Tags)]
pub enum ApiTags {
    Jobs,
    ServiceWork,
    Healthcheck,
}

/// EDL bearer token of the calling user.
#[derive(SecurityScheme)]
#[oai(ty = "bearer")]
pub struct HarmonySecurityScheme(pub Bearer);

impl HarmonySecurityScheme {
    pub fn token(&self) -> &str {
        &self.0.token
    }
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    /// Invalid request, returning with a list of issues detected in the request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Unauthorized request
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Forbidden Request
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    /// Entity not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    #[oai(status = 409)]
    Conflict(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn not_found(error: impl Into<String>) -> Self {
        ApiError::NotFound(Json(ErrorBody {
            error: error.into(),
        }))
    }

    pub fn unauthorized(error: impl Into<String>) -> Self {
        ApiError::Unauthorized(Json(ErrorBody {
            error: error.into(),
        }))
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        ApiError::BadRequest(Json(ErrorsBody {
            errors: vec![error.into()],
        }))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<JobStoreError> for ApiError {
    fn from(value: JobStoreError) -> Self {
        match &value {
            JobStoreError::JobNotFound(_)
            | JobStoreError::WorkItemNotFound(_)
            | JobStoreError::StepNotFound { .. } => ApiError::NotFound(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            JobStoreError::WorkItemAlreadyTerminal(_)
            | JobStoreError::StepAlreadyTerminal { .. }
            | JobStoreError::InvalidTransition { .. } => ApiError::Conflict(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            JobStoreError::InvalidCompletionStatus(_) => ApiError::BadRequest(Json(ErrorsBody {
                errors: vec![value.to_safe_string()],
            })),
            JobStoreError::Repo(_) => ApiError::InternalError(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
        }
    }
}

impl From<JobServiceError> for ApiError {
    fn from(value: JobServiceError) -> Self {
        match &value {
            JobServiceError::NotFound(_) => ApiError::NotFound(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            JobServiceError::Forbidden => ApiError::Forbidden(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            JobServiceError::NoMatch(_) | JobServiceError::Plan(_) => {
                ApiError::BadRequest(Json(ErrorsBody {
                    errors: vec![value.to_safe_string()],
                }))
            }
            JobServiceError::InvalidTransition { .. } => ApiError::Conflict(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            JobServiceError::Cmr(_) | JobServiceError::Store(_) => {
                ApiError::InternalError(Json(ErrorBody {
                    error: value.to_safe_string(),
                }))
            }
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(value: IdentityError) -> Self {
        match &value {
            IdentityError::InvalidToken => ApiError::Unauthorized(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            _ => ApiError::InternalError(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
        }
    }
}

pub type Apis = (jobs::JobsApi, work::ServiceWorkApi, healthcheck::HealthcheckApi);

pub fn make_open_api_service(services: &Services) -> OpenApiService<Apis, ()> {
    OpenApiService::new(
        (
            jobs::JobsApi {
                job_service: services.job_service.clone(),
                identity: services.identity.clone(),
            },
            work::ServiceWorkApi {
                work_coordinator: services.work_coordinator.clone(),
            },
            healthcheck::HealthcheckApi,
        ),
        "Harmony API",
        "1.0",
    )
}

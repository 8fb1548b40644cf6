use crate::api::ApiTags;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct HealthcheckResponse {
    pub message: String,
}

pub struct HealthcheckApi;

#[OpenApi(prefix_path = "/health", tag = ApiTags::Healthcheck)]
impl HealthcheckApi {
    #[oai(path = "/", method = "get", operation_id = "healthcheck")]
    async fn healthcheck(&self) -> Json<HealthcheckResponse> {
        Json(HealthcheckResponse {
            message: "OK".to_string(),
        })
    }
}

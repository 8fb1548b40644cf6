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

use harmony_common::config::{ConfigLoader, DbConfig, RetryConfig};
use harmony_common::operation::DEFAULT_POINT_BBOX_SIDE_DEGREES;
use harmony_common::tracing::TracingConfig;
use harmony_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub db: DbConfig,
    /// Identifies this deployment in outbound CMR requests.
    pub client_id: String,
    /// Shared secret required by the deployment callback endpoint.
    pub cookie_secret: String,
    pub cmr: CmrConfig,
    pub identity: IdentityConfig,
    pub object_store: ObjectStoreConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    /// Side length in degrees of the bounding box synthesized around a point
    /// subset for services that only take rectangles.
    pub point_bbox_side_degrees: f64,
    pub cors_origin_regex: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("harmony-orchestrator"),
            environment: "dev".to_string(),
            http_port: 8080,
            db: DbConfig::default(),
            client_id: std::env::var("CLIENT_ID").unwrap_or_else(|_| "harmony-unknown".to_string()),
            cookie_secret: "local-dev-cookie-secret".to_string(),
            cmr: CmrConfig::default(),
            identity: IdentityConfig::default(),
            object_store: ObjectStoreConfig::default(),
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            point_bbox_side_degrees: DEFAULT_POINT_BBOX_SIDE_DEGREES,
            cors_origin_regex: "https://.*\\.earthdata\\.nasa\\.gov".to_string(),
        }
    }
}

impl SafeDisplay for OrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "client id: {}", self.client_id);
        let _ = writeln!(&mut result, "cookie secret: ****");
        let _ = writeln!(&mut result, "CMR:");
        let _ = writeln!(&mut result, "{}", self.cmr.to_safe_string_indented());
        let _ = writeln!(&mut result, "identity:");
        let _ = writeln!(&mut result, "{}", self.identity.to_safe_string_indented());
        let _ = writeln!(&mut result, "object store:");
        let _ = writeln!(
            &mut result,
            "{}",
            self.object_store.to_safe_string_indented()
        );
        let _ = writeln!(&mut result, "registry:");
        let _ = writeln!(&mut result, "{}", self.registry.to_safe_string_indented());
        let _ = writeln!(&mut result, "scheduler:");
        let _ = writeln!(&mut result, "{}", self.scheduler.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CmrConfig {
    pub endpoint: Url,
    /// Granules per CMR query session page; also the page size bound handed
    /// to the query service as `maxCmrGranules`.
    pub page_size: i32,
    pub retries: RetryConfig,
}

impl Default for CmrConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse("https://cmr.uat.earthdata.nasa.gov").expect("valid CMR URL"),
            page_size: 2000,
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for CmrConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "endpoint: {}", self.endpoint);
        let _ = writeln!(&mut result, "page size: {}", self.page_size);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub endpoint: Url,
    pub client_id: String,
    pub client_secret: String,
    pub retries: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            endpoint: Url::parse("https://uat.urs.earthdata.nasa.gov").expect("valid EDL URL"),
            client_id: "harmony".to_string(),
            client_secret: "".to_string(),
            retries: RetryConfig::default(),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl SafeDisplay for IdentityConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "endpoint: {}", self.endpoint);
        let _ = writeln!(&mut result, "client id: {}", self.client_id);
        let _ = writeln!(&mut result, "client secret: ****");
        let _ = writeln!(&mut result, "cache TTL: {:?}", self.cache_ttl);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub region: String,
    /// Overridden for localstack in tests and local development.
    pub endpoint: Option<Url>,
    pub bucket: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            endpoint: None,
            bucket: "harmony-staging".to_string(),
        }
    }
}

impl SafeDisplay for ObjectStoreConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "region: {}", self.region);
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(&mut result, "endpoint: {endpoint}");
        }
        let _ = writeln!(&mut result, "bucket: {}", self.bucket);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub services_file: PathBuf,
    /// Global cap on granules per request; service granule limits and batch
    /// sizes must stay below it.
    pub max_granule_limit: i32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            services_file: PathBuf::from("config/services.yml"),
            max_granule_limit: 10000,
        }
    }
}

impl SafeDisplay for RegistryConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "services file: {:?}", self.services_file);
        let _ = writeln!(&mut result, "max granule limit: {}", self.max_granule_limit);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrency cap applied to services that do not declare their own.
    pub default_concurrency: i32,
    /// Retries per work item for transient failures before the item is
    /// marked failed.
    pub work_item_retry_cap: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 20,
            work_item_retry_cap: 3,
        }
    }
}

impl SafeDisplay for SchedulerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "default concurrency: {}",
            self.default_concurrency
        );
        let _ = writeln!(
            &mut result,
            "work item retry cap: {}",
            self.work_item_retry_cap
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<OrchestratorConfig> {
    ConfigLoader::new(&PathBuf::from("config/harmony-orchestrator.toml"))
}

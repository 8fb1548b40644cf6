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

use harmony_common::config::{ConfigLoader, RetryConfig};
use harmony_common::tracing::TracingConfig;
use harmony_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    pub coordinator_url: Url,
    /// The service image tag this worker pulls work for.
    pub service_id: String,
    pub pod_name: String,
    /// Cooperative backoff applied after an empty poll (the coordinator
    /// answered 404).
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Wall clock bound per invocation; exceeding it reports the item as a
    /// timeout failure.
    #[serde(with = "humantime_serde")]
    pub invocation_timeout: Duration,
    /// Fetches survive any coordinator outage.
    pub fetch_retries: RetryConfig,
    /// Completions are bounded to avoid duplicate results.
    pub completion_retries: RetryConfig,
    pub max_prime_retries: u32,
    /// Written while an item is being processed.
    pub working_marker: PathBuf,
    /// Written by the PreStop hook; the loop exits at the next iteration.
    pub termination_marker: PathBuf,
    /// Where the sidecar writes its `catalog*.json` outputs.
    pub metadata_dir: PathBuf,
    pub staging_bucket: String,
    pub invoker: InvokerConfig,
    pub storage: WorkerStorageConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("harmony-worker"),
            coordinator_url: Url::parse("http://localhost:8080").expect("valid coordinator URL"),
            service_id: "harmonyservices/service-example:latest".to_string(),
            pod_name: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-pod".to_string()),
            poll_interval: Duration::from_secs(3),
            invocation_timeout: Duration::from_secs(600),
            fetch_retries: RetryConfig::default().unbounded(),
            completion_retries: RetryConfig::default(),
            max_prime_retries: 3,
            working_marker: PathBuf::from("/tmp/WORKING"),
            termination_marker: PathBuf::from("/tmp/TERMINATING"),
            metadata_dir: PathBuf::from("/tmp/metadata"),
            staging_bucket: "harmony-staging".to_string(),
            invoker: InvokerConfig::default(),
            storage: WorkerStorageConfig::default(),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "coordinator: {}", self.coordinator_url);
        let _ = writeln!(&mut result, "service id: {}", self.service_id);
        let _ = writeln!(&mut result, "pod name: {}", self.pod_name);
        let _ = writeln!(&mut result, "poll interval: {:?}", self.poll_interval);
        let _ = writeln!(
            &mut result,
            "invocation timeout: {:?}",
            self.invocation_timeout
        );
        let _ = writeln!(&mut result, "metadata dir: {:?}", self.metadata_dir);
        result
    }
}

/// How the service sidecar is reached: the CMR query service runs an HTTP
/// server in its container, every other service is an argv invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum InvokerConfig {
    Exec(ExecInvokerConfig),
    Http(HttpInvokerConfig),
}

impl Default for InvokerConfig {
    fn default() -> Self {
        InvokerConfig::Exec(ExecInvokerConfig {
            program: PathBuf::from("/opt/harmony/service-runner"),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecInvokerConfig {
    pub program: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpInvokerConfig {
    pub url: Url,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum WorkerStorageConfig {
    S3(S3StorageConfig),
    LocalFileSystem(LocalFileSystemStorageConfig),
}

impl Default for WorkerStorageConfig {
    fn default() -> Self {
        WorkerStorageConfig::LocalFileSystem(LocalFileSystemStorageConfig {
            root: PathBuf::from("../data/worker-storage"),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct S3StorageConfig {
    pub region: String,
    pub endpoint: Option<Url>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalFileSystemStorageConfig {
    pub root: PathBuf,
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new(&PathBuf::from("config/harmony-worker.toml"))
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::path::PathBuf;
    use test_r::test;

    use crate::config::make_config_loader;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}

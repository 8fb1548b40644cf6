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

//! Invokes the service sidecar for one work item: an argv spawn for regular
//! transformation services, an in-container HTTP call for the CMR query
//! service. Output catalogs are discovered in the metadata directory;
//! stdout/stderr are captured line by line for upload.

use crate::config::{ExecInvokerConfig, HttpInvokerConfig};
use async_trait::async_trait;
use harmony_common::model::{ErrorKind, WorkForService, WorkItemWire};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Failed to start the service process: {0}")]
    Spawn(std::io::Error),
    #[error("Invocation exceeded the configured timeout")]
    Timeout,
    #[error("Service exited with status {code}: {detail}")]
    Failed { code: i32, detail: String },
    #[error("Service HTTP call failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error during invocation: {0}")]
    Io(#[from] std::io::Error),
}

impl InvokeError {
    /// Maps the invocation outcome onto the orchestrator's failure
    /// taxonomy.
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            InvokeError::Timeout => ErrorKind::Timeout,
            InvokeError::Failed { .. } => ErrorKind::ServiceReported,
            InvokeError::Spawn(_) | InvokeError::Http(_) | InvokeError::Io(_) => {
                ErrorKind::TransientInfrastructure
            }
        }
    }
}

/// A produced catalog: a local file the worker still has to stage, or a URL
/// the service already staged itself.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogRef {
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Default)]
pub struct InvocationOutput {
    pub catalogs: Vec<CatalogRef>,
    pub log_lines: Vec<String>,
    /// Continuation cursor reported by the CMR query service.
    pub scroll_id: Option<String>,
    /// Total hits reported by the CMR query service on its first page.
    pub hits: Option<i64>,
}

#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    async fn invoke(
        &self,
        work: &WorkForService,
        metadata_dir: &Path,
    ) -> Result<InvocationOutput, InvokeError>;

    /// One dry run at startup to surface configuration errors early.
    async fn prime(&self) -> Result<(), InvokeError>;
}

/// The fixed invocation shape every transformation container understands.
pub fn build_args(work: &WorkItemWire, metadata_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--harmony-action".to_string(),
        "invoke".to_string(),
        "--harmony-input".to_string(),
        work.operation.to_string(),
    ];
    if let Some(sources) = work.stac_catalog_locations.first() {
        args.push("--harmony-sources".to_string());
        args.push(sources.clone());
    }
    args.push("--harmony-metadata-dir".to_string());
    args.push(metadata_dir.to_string_lossy().to_string());
    args
}

/// Lists `catalog*.json` files in the metadata directory, sorted by name so
/// `catalog0.json`, `catalog1.json`, ... keep their order.
pub fn discover_catalogs(metadata_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut catalogs: Vec<PathBuf> = std::fs::read_dir(metadata_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with("catalog") && name.ends_with(".json"))
                .unwrap_or(false)
        })
        .collect();
    catalogs.sort();
    Ok(catalogs)
}

pub struct ExecInvoker {
    config: ExecInvokerConfig,
    timeout: Duration,
}

impl ExecInvoker {
    pub fn new(config: ExecInvokerConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl ServiceInvoker for ExecInvoker {
    async fn invoke(
        &self,
        work: &WorkForService,
        metadata_dir: &Path,
    ) -> Result<InvocationOutput, InvokeError> {
        let args = build_args(&work.work_item, metadata_dir);
        debug!(program = ?self.config.program, "Invoking service");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(InvokeError::Spawn)?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let run = async {
            // stderr is drained concurrently so a full pipe cannot stall
            // the child
            let stderr_task = tokio::spawn(async move {
                let mut lines = Vec::new();
                let mut err_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = err_lines.next_line().await {
                    lines.push(line);
                }
                lines
            });

            let mut log_lines = Vec::new();
            let mut out_lines = BufReader::new(stdout).lines();
            while let Some(line) = out_lines.next_line().await? {
                log_lines.push(line);
            }
            let status = child.wait().await?;
            let mut stderr_lines = stderr_task.await.unwrap_or_default();
            log_lines.append(&mut stderr_lines);
            Ok::<_, InvokeError>((status, log_lines))
        };

        let (status, log_lines) = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => return Err(InvokeError::Timeout),
        };

        if !status.success() {
            let detail = log_lines
                .iter()
                .rev()
                .take(5)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");
            return Err(InvokeError::Failed {
                code: status.code().unwrap_or(-1),
                detail,
            });
        }

        let catalogs = discover_catalogs(metadata_dir)?
            .into_iter()
            .map(CatalogRef::Local)
            .collect();
        Ok(InvocationOutput {
            catalogs,
            log_lines,
            scroll_id: None,
            hits: None,
        })
    }

    async fn prime(&self) -> Result<(), InvokeError> {
        // spawning exercises the image entrypoint without doing work; a
        // missing binary or broken dynamic linkage shows up here instead of
        // on the first real item
        Command::new(&self.config.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(InvokeError::Spawn)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct HttpInvocationResponse {
    #[serde(default)]
    catalogs: Vec<String>,
    #[serde(rename = "scrollID")]
    scroll_id: Option<String>,
    hits: Option<i64>,
}

pub struct HttpInvoker {
    config: HttpInvokerConfig,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpInvoker {
    pub fn new(config: HttpInvokerConfig, timeout: Duration) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ServiceInvoker for HttpInvoker {
    async fn invoke(
        &self,
        work: &WorkForService,
        _metadata_dir: &Path,
    ) -> Result<InvocationOutput, InvokeError> {
        let body = serde_json::json!({
            "operation": work.work_item.operation,
            "scrollID": work.work_item.scroll_id,
            "maxCmrGranules": work.max_cmr_granules,
        });
        let request = self.http.post(self.config.url.clone()).json(&body).send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result?,
            Err(_) => return Err(InvokeError::Timeout),
        };
        if !response.status().is_success() {
            let code = response.status().as_u16() as i32;
            let detail = response.text().await.unwrap_or_default();
            return Err(InvokeError::Failed { code, detail });
        }
        let parsed: HttpInvocationResponse = response.json().await?;
        Ok(InvocationOutput {
            catalogs: parsed.catalogs.into_iter().map(CatalogRef::Remote).collect(),
            log_lines: vec![],
            scroll_id: parsed.scroll_id,
            hits: parsed.hits,
        })
    }

    async fn prime(&self) -> Result<(), InvokeError> {
        self.http.get(self.config.url.clone()).send().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn wire(inputs: Vec<String>) -> WorkItemWire {
        WorkItemWire {
            id: 7,
            job_id: uuid::Uuid::nil(),
            service_id: "example/service:1".to_string(),
            workflow_step_index: 2,
            scroll_id: None,
            stac_catalog_locations: inputs,
            operation: serde_json::json!({"version": "0.22.0"}),
            retry_count: 0,
        }
    }

    #[test]
    fn invocation_arguments_have_the_fixed_shape() {
        let work = wire(vec!["s3://o/catalog0.json".to_string()]);
        let args = build_args(&work, Path::new("/tmp/metadata"));
        let expected: Vec<String> = [
            "--harmony-action",
            "invoke",
            "--harmony-input",
            "{\"version\":\"0.22.0\"}",
            "--harmony-sources",
            "s3://o/catalog0.json",
            "--harmony-metadata-dir",
            "/tmp/metadata",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn query_items_have_no_sources_argument() {
        let work = wire(vec![]);
        let args = build_args(&work, Path::new("/tmp/metadata"));
        assert!(!args.contains(&"--harmony-sources".to_string()));
    }

    #[test]
    fn catalogs_are_discovered_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["catalog1.json", "catalog0.json", "other.json", "catalog.txt"] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        let catalogs = discover_catalogs(dir.path()).unwrap();
        let names: Vec<_> = catalogs
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["catalog0.json", "catalog1.json"]);
    }
}

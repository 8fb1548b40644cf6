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

//! The per-container worker loop: poll, invoke, stage outputs, report.
//! Single-threaded with respect to its invocation: one item in flight at a
//! time. Shutdown is cooperative through the termination marker written by
//! the PreStop hook; an in-flight invocation completes and is reported
//! before the loop exits.

use crate::client::{CompletionDisposition, CoordinatorApi};
use crate::config::WorkerConfig;
use crate::invoker::{CatalogRef, InvokeError, ServiceInvoker};
use crate::storage::WorkerStorage;
use anyhow::anyhow;
use harmony_common::model::{WorkForService, WorkItemCompletion, WorkItemStatus};
use harmony_common::retries::calculate_delay;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct WorkerLoop {
    client: Arc<dyn CoordinatorApi>,
    invoker: Arc<dyn ServiceInvoker>,
    storage: Arc<dyn WorkerStorage>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        client: Arc<dyn CoordinatorApi>,
        invoker: Arc<dyn ServiceInvoker>,
        storage: Arc<dyn WorkerStorage>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            client,
            invoker,
            storage,
            config,
        }
    }

    /// One dry invocation at startup so misconfigured images fail fast.
    /// Exhausting the retries is fatal; the orchestrator restarts the
    /// container.
    pub async fn prime(&self) -> anyhow::Result<()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.invoker.prime().await {
                Ok(()) => {
                    info!("Service primed");
                    return Ok(());
                }
                Err(error) if attempt < self.config.max_prime_retries => {
                    warn!(attempt, "Priming failed, retrying: {error}");
                    tokio::time::sleep(calculate_delay(&self.config.fetch_retries, attempt)).await;
                }
                Err(error) => {
                    error!("Priming failed after {attempt} attempts: {error}");
                    return Err(anyhow!("service priming failed: {error}"));
                }
            }
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.prime().await?;

        loop {
            if self.config.termination_marker.exists() {
                info!("Termination marker present, exiting worker loop");
                break;
            }

            match self.client.fetch_work().await {
                Err(error) => {
                    warn!("Failed to fetch work: {error}");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(None) => {
                    let _ = std::fs::remove_file(&self.config.working_marker);
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(Some(work)) => {
                    if let Err(error) = std::fs::write(&self.config.working_marker, b"") {
                        warn!("Failed to write working marker: {error}");
                    }
                    self.process(work).await;
                    let _ = std::fs::remove_file(&self.config.working_marker);
                }
            }
        }

        let _ = std::fs::remove_file(&self.config.working_marker);
        Ok(())
    }

    async fn process(&self, work: WorkForService) {
        let item_id = work.work_item.id;
        info!(
            item = item_id,
            job = %work.work_item.job_id,
            "Processing work item"
        );

        // clear artifacts of the previous invocation
        let _ = tokio::fs::remove_dir_all(&self.config.metadata_dir).await;
        if let Err(error) = tokio::fs::create_dir_all(&self.config.metadata_dir).await {
            error!("Failed to prepare metadata dir: {error}");
            return;
        }

        let completion = match self.invoker.invoke(&work, &self.config.metadata_dir).await {
            Ok(output) => {
                self.upload_logs(&work, &output.log_lines).await;
                match self.stage_outputs(&work, output.catalogs).await {
                    Ok((results, sizes)) => WorkItemCompletion {
                        status: WorkItemStatus::Successful,
                        total_granules_size: sizes.iter().sum(),
                        output_item_sizes: sizes,
                        results,
                        error: None,
                        error_kind: None,
                        scroll_id: output.scroll_id,
                        hits: output.hits,
                    },
                    Err(error) => {
                        warn!(item = item_id, "Failed to stage outputs: {error}");
                        WorkItemCompletion {
                            status: WorkItemStatus::Failed,
                            results: vec![],
                            total_granules_size: 0,
                            output_item_sizes: vec![],
                            error: Some(format!("failed to stage outputs: {error}")),
                            error_kind: Some(harmony_common::model::ErrorKind::TransientInfrastructure),
                            scroll_id: None,
                            hits: None,
                        }
                    }
                }
            }
            Err(error) => {
                warn!(item = item_id, "Invocation failed: {error}");
                let kind = error.error_kind();
                let message = match &error {
                    InvokeError::Timeout => format!(
                        "service did not complete within {} seconds",
                        self.config.invocation_timeout.as_secs()
                    ),
                    other => other.to_string(),
                };
                WorkItemCompletion {
                    status: WorkItemStatus::Failed,
                    results: vec![],
                    total_granules_size: 0,
                    output_item_sizes: vec![],
                    error: Some(message),
                    error_kind: Some(kind),
                    scroll_id: None,
                    hits: None,
                }
            }
        };

        match self.client.complete_work(item_id, &completion).await {
            Ok(CompletionDisposition::Recorded) => {}
            Ok(CompletionDisposition::Discarded) => {
                info!(item = item_id, "Item moved on without us, outputs discarded");
            }
            Err(error) => {
                error!(item = item_id, "Failed to report completion: {error}");
            }
        }
    }

    /// Local catalogs are staged under `public/<jobID>/<workItemID>/`;
    /// remote ones (the query service stages its own) pass through.
    async fn stage_outputs(
        &self,
        work: &WorkForService,
        catalogs: Vec<CatalogRef>,
    ) -> anyhow::Result<(Vec<String>, Vec<i64>)> {
        let mut results = Vec::with_capacity(catalogs.len());
        let mut sizes = Vec::with_capacity(catalogs.len());
        for catalog in catalogs {
            match catalog {
                CatalogRef::Remote(url) => {
                    sizes.push(0);
                    results.push(url);
                }
                CatalogRef::Local(path) => {
                    let bytes = tokio::fs::read(&path).await?;
                    let name = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .ok_or_else(|| anyhow!("catalog path has no file name"))?;
                    let url = format!(
                        "s3://{}/public/{}/{}/{}",
                        self.config.staging_bucket, work.work_item.job_id, work.work_item.id, name
                    );
                    sizes.push(bytes.len() as i64);
                    self.storage
                        .put(&url, bytes)
                        .await
                        .map_err(|e| anyhow!("{e}"))?;
                    results.push(url);
                }
            }
        }
        Ok((results, sizes))
    }

    async fn upload_logs(&self, work: &WorkForService, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let url = format!(
            "s3://{}/logs/{}/{}.log",
            self.config.staging_bucket, work.work_item.job_id, work.work_item.id
        );
        if let Err(error) = self.storage.put(&url, lines.join("\n").into_bytes()).await {
            warn!("Failed to upload invocation logs: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::client::ClientError;
    use crate::invoker::InvocationOutput;
    use crate::storage::FileSystemWorkerStorage;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    struct StubCoordinator {
        work: Mutex<Vec<WorkForService>>,
        completions: Mutex<Vec<(i64, WorkItemCompletion)>>,
        termination_marker: std::path::PathBuf,
    }

    #[async_trait]
    impl CoordinatorApi for StubCoordinator {
        async fn fetch_work(&self) -> Result<Option<WorkForService>, ClientError> {
            Ok(self.work.lock().unwrap().pop())
        }

        async fn complete_work(
            &self,
            id: i64,
            completion: &WorkItemCompletion,
        ) -> Result<CompletionDisposition, ClientError> {
            self.completions
                .lock()
                .unwrap()
                .push((id, completion.clone()));
            // stop the loop after the first item
            std::fs::write(&self.termination_marker, b"").unwrap();
            Ok(CompletionDisposition::Recorded)
        }
    }

    struct StubInvoker {
        catalog_name: String,
    }

    #[async_trait]
    impl ServiceInvoker for StubInvoker {
        async fn invoke(
            &self,
            _work: &WorkForService,
            metadata_dir: &Path,
        ) -> Result<InvocationOutput, InvokeError> {
            let path = metadata_dir.join(&self.catalog_name);
            std::fs::write(&path, b"{\"type\": \"Catalog\"}")?;
            Ok(InvocationOutput {
                catalogs: vec![CatalogRef::Local(path)],
                log_lines: vec!["processing granule".to_string()],
                scroll_id: None,
                hits: None,
            })
        }

        async fn prime(&self) -> Result<(), InvokeError> {
            Ok(())
        }
    }

    fn wire_work() -> WorkForService {
        WorkForService {
            work_item: harmony_common::model::WorkItemWire {
                id: 42,
                job_id: uuid::Uuid::new_v4(),
                service_id: "example/service:1".to_string(),
                workflow_step_index: 2,
                scroll_id: None,
                stac_catalog_locations: vec!["s3://o/in.json".to_string()],
                operation: serde_json::json!({"version": "0.22.0"}),
                retry_count: 0,
            },
            max_cmr_granules: None,
        }
    }

    fn test_config(dir: &Path) -> WorkerConfig {
        WorkerConfig {
            working_marker: dir.join("WORKING"),
            termination_marker: dir.join("TERMINATING"),
            metadata_dir: dir.join("metadata"),
            staging_bucket: "test-bucket".to_string(),
            poll_interval: std::time::Duration::from_millis(5),
            ..WorkerConfig::default()
        }
    }

    #[test]
    async fn processes_one_item_then_honors_the_termination_marker() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let coordinator = Arc::new(StubCoordinator {
            work: Mutex::new(vec![wire_work()]),
            completions: Mutex::new(vec![]),
            termination_marker: config.termination_marker.clone(),
        });
        let storage_root = dir.path().join("storage");
        let worker = WorkerLoop::new(
            coordinator.clone(),
            Arc::new(StubInvoker {
                catalog_name: "catalog0.json".to_string(),
            }),
            Arc::new(FileSystemWorkerStorage::new(
                &crate::config::LocalFileSystemStorageConfig {
                    root: storage_root.clone(),
                },
            )),
            config,
        );

        worker.run().await.unwrap();

        let completions = coordinator.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        let (id, completion) = &completions[0];
        assert_eq!(*id, 42);
        assert_eq!(completion.status, WorkItemStatus::Successful);
        assert_eq!(completion.results.len(), 1);
        assert!(completion.results[0].starts_with("s3://test-bucket/public/"));
        assert!(completion.results[0].ends_with("/42/catalog0.json"));
        assert_eq!(completion.output_item_sizes.len(), 1);

        // the staged catalog landed in storage
        let staged = completion.results[0].strip_prefix("s3://").unwrap();
        assert!(storage_root.join(staged).exists());
    }

    #[test]
    async fn failed_invocations_report_the_error_kind() {
        struct FailingInvoker;

        #[async_trait]
        impl ServiceInvoker for FailingInvoker {
            async fn invoke(
                &self,
                _work: &WorkForService,
                _metadata_dir: &Path,
            ) -> Result<InvocationOutput, InvokeError> {
                Err(InvokeError::Timeout)
            }

            async fn prime(&self) -> Result<(), InvokeError> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let coordinator = Arc::new(StubCoordinator {
            work: Mutex::new(vec![wire_work()]),
            completions: Mutex::new(vec![]),
            termination_marker: config.termination_marker.clone(),
        });
        let worker = WorkerLoop::new(
            coordinator.clone(),
            Arc::new(FailingInvoker),
            Arc::new(FileSystemWorkerStorage::new(
                &crate::config::LocalFileSystemStorageConfig {
                    root: dir.path().join("storage"),
                },
            )),
            config,
        );

        worker.run().await.unwrap();

        let completions = coordinator.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        let (_, completion) = &completions[0];
        assert_eq!(completion.status, WorkItemStatus::Failed);
        assert_eq!(
            completion.error_kind,
            Some(harmony_common::model::ErrorKind::Timeout)
        );
        assert!(completion.error.as_deref().unwrap().contains("seconds"));
    }
}

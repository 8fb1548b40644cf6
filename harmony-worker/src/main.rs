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

use harmony_common::tracing::init_tracing_with_default_env_filter;
use harmony_worker::client::CoordinatorClient;
use harmony_worker::config::{make_config_loader, InvokerConfig, WorkerConfig};
use harmony_worker::invoker::{ExecInvoker, HttpInvoker, ServiceInvoker};
use harmony_worker::storage;
use harmony_worker::work_loop::WorkerLoop;
use std::sync::Arc;
use tracing::error;

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn async_main(config: WorkerConfig) -> Result<(), std::io::Error> {
    let client = Arc::new(CoordinatorClient::new(&config));

    let invoker: Arc<dyn ServiceInvoker> = match config.invoker.clone() {
        InvokerConfig::Exec(exec) => Arc::new(ExecInvoker::new(exec, config.invocation_timeout)),
        InvokerConfig::Http(http) => Arc::new(HttpInvoker::new(http, config.invocation_timeout)),
    };

    let storage: Arc<dyn storage::WorkerStorage> = storage::make_storage(&config.storage)
        .await
        .into();

    let worker = WorkerLoop::new(client, invoker, storage, config);
    if let Err(e) = worker.run().await {
        // repeated priming failures land here; exiting lets the
        // orchestrator restart the container
        error!("Worker exited with error: {e}");
        std::process::exit(1);
    }
    Ok(())
}

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

use harmony_common::config::DbConfig;
use harmony_common::tracing::init_tracing_with_default_env_filter;
use harmony_orchestrator::config::{make_config_loader, OrchestratorConfig};
use harmony_orchestrator::{db, metrics, OrchestratorService};
use prometheus::Registry;
use tokio::task::JoinSet;
use tracing::error;

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        let prometheus = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config, prometheus))
    } else {
        Ok(())
    }
}

async fn async_main(
    config: OrchestratorConfig,
    prometheus_registry: Registry,
) -> Result<(), std::io::Error> {
    match config.db.clone() {
        DbConfig::Postgres(c) => {
            db::postgres_migrate(&c).await.map_err(|e| {
                error!("DB - init error: {}", e);
                std::io::Error::other(format!("Init error: {e:?}"))
            })?;
        }
        DbConfig::Sqlite(c) => {
            db::sqlite_migrate(&c).await.map_err(|e| {
                error!("DB - init error: {}", e);
                std::io::Error::other(format!("Init error: {e:?}"))
            })?;
        }
    };

    let server = OrchestratorService::new(config, prometheus_registry)
        .await
        .map_err(std::io::Error::other)?;

    let mut join_set = JoinSet::new();
    server
        .run(&mut join_set)
        .await
        .map_err(std::io::Error::other)?;

    while let Some(result) = join_set.join_next().await {
        result
            .map_err(std::io::Error::other)?
            .map_err(std::io::Error::other)?;
    }
    Ok(())
}

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

pub mod jobs;
pub mod scheduler;
pub mod work;

use crate::clients::cmr::{CmrClient, HttpCmrClient};
use crate::clients::identity::{HttpIdentityClient, IdentityClient};
use crate::clients::object_store::{ObjectStore, S3ObjectStore};
use crate::config::OrchestratorConfig;
use crate::db;
use crate::registry::ServiceRegistry;
use crate::repo::job::{DbJobRepo, JobRepo};
use crate::repo::work::{CompletionPolicy, DbWorkRepo, WorkRepo};
use crate::service::jobs::JobService;
use crate::service::scheduler::Scheduler;
use crate::service::work::WorkCoordinator;
use harmony_common::config::DbConfig;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub job_repo: Arc<dyn JobRepo>,
    pub work_repo: Arc<dyn WorkRepo>,
    pub registry: Arc<ServiceRegistry>,
    pub identity: Arc<dyn IdentityClient>,
    pub object_store: Arc<dyn ObjectStore>,
    pub scheduler: Arc<Scheduler>,
    pub work_coordinator: Arc<WorkCoordinator>,
    pub job_service: Arc<JobService>,
}

impl Services {
    pub async fn new(config: &OrchestratorConfig) -> Result<Services, String> {
        let env: HashMap<String, String> = std::env::vars().collect();
        let registry = Arc::new(
            ServiceRegistry::from_file(
                &config.registry.services_file,
                &env,
                config.registry.max_granule_limit,
            )
            .map_err(|e| e.to_string())?,
        );

        let (job_repo, work_repo): (Arc<dyn JobRepo>, Arc<dyn WorkRepo>) =
            match config.db.clone() {
                DbConfig::Postgres(db_config) => {
                    let pool = Arc::new(
                        db::create_postgres_pool(&db_config)
                            .await
                            .map_err(|e| e.to_string())?,
                    );
                    (
                        Arc::new(DbJobRepo::new(pool.clone())),
                        Arc::new(DbWorkRepo::new(pool)),
                    )
                }
                DbConfig::Sqlite(db_config) => {
                    let pool = Arc::new(
                        db::create_sqlite_pool(&db_config)
                            .await
                            .map_err(|e| e.to_string())?,
                    );
                    (
                        Arc::new(DbJobRepo::new(pool.clone())),
                        Arc::new(DbWorkRepo::new(pool)),
                    )
                }
            };

        let cmr: Arc<dyn CmrClient> = Arc::new(HttpCmrClient::new(&config.cmr, &config.client_id));
        let identity: Arc<dyn IdentityClient> = Arc::new(HttpIdentityClient::new(&config.identity));
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(S3ObjectStore::new(&config.object_store).await);

        let scheduler = Arc::new(Scheduler::new(
            work_repo.clone(),
            registry.clone(),
            config.scheduler.default_concurrency,
            config.cmr.page_size,
        ));

        let work_coordinator = Arc::new(WorkCoordinator::new(
            scheduler.clone(),
            work_repo.clone(),
            CompletionPolicy {
                retry_cap: config.scheduler.work_item_retry_cap,
            },
            registry.clone(),
            config.cookie_secret.clone(),
        ));

        let job_service = Arc::new(JobService::new(
            job_repo.clone(),
            registry.clone(),
            cmr,
            config.cmr.page_size,
            config.registry.max_granule_limit,
        ));

        Ok(Services {
            job_repo,
            work_repo,
            registry,
            identity,
            object_store,
            scheduler,
            work_coordinator,
            job_service,
        })
    }
}

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

pub mod api;
pub mod clients;
pub mod config;
pub mod db;
pub mod failure;
pub mod metrics;
pub mod model;
pub mod planner;
pub mod registry;
pub mod repo;
pub mod service;

use crate::config::OrchestratorConfig;
use crate::service::Services;
use anyhow::anyhow;
use poem::endpoint::PrometheusExporter;
use poem::listener::{Acceptor, Listener};
use poem::middleware::Cors;
use poem::{EndpointExt, Route};
use prometheus::Registry;
use tokio::task::JoinSet;
use tracing::{debug, info};

#[cfg(test)]
test_r::enable!();

pub struct RunDetails {
    pub http_port: u16,
}

#[derive(Clone)]
pub struct OrchestratorService {
    config: OrchestratorConfig,
    prometheus_registry: Registry,
    services: Services,
}

impl OrchestratorService {
    pub async fn new(
        config: OrchestratorConfig,
        prometheus_registry: Registry,
    ) -> Result<Self, anyhow::Error> {
        debug!("Initializing orchestrator");

        let services = Services::new(&config)
            .await
            .map_err(|err| anyhow!(err).context("Service initialization"))?;

        Ok(Self {
            config,
            prometheus_registry,
            services,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let http_port = self.start_http_server(join_set).await?;
        info!("Started harmony orchestrator on port {}", http_port);
        Ok(RunDetails { http_port })
    }

    async fn start_http_server(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<u16, anyhow::Error> {
        let api_service = api::make_open_api_service(&self.services);

        let ui = api_service.swagger_ui();
        let spec = api_service.spec_endpoint_yaml();
        let metrics = PrometheusExporter::new(self.prometheus_registry.clone());

        let cors = Cors::new()
            .allow_origin_regex(&self.config.cors_origin_regex)
            .allow_credentials(true);

        let app = Route::new()
            .nest("/", api_service)
            .nest("/docs", ui)
            .nest("/specs", spec)
            .nest("/metrics", metrics)
            .with(cors);

        let poem_listener =
            poem::listener::TcpListener::bind(format!("0.0.0.0:{}", self.config.http_port));
        let acceptor = poem_listener.into_acceptor().await?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .expect("socket address")
            .port();

        join_set.spawn(async move {
            poem::Server::new_with_acceptor(acceptor)
                .run(app)
                .await
                .map_err(|e| e.into())
        });

        Ok(port)
    }
}

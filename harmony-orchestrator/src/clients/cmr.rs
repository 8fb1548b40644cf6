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

use crate::config::CmrConfig;
use async_trait::async_trait;
use harmony_common::model::CollectionId;
use harmony_common::operation::TemporalRange;
use harmony_common::retries::with_retries;
use harmony_common::SafeDisplay;
use url::Url;

/// An open CMR granule query session: the opaque pagination cursor plus the
/// total hit count reported by the first page.
#[derive(Debug, Clone, PartialEq)]
pub struct GranuleSession {
    pub scroll_id: String,
    pub hits: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GranuleQuery {
    pub collections: Vec<CollectionId>,
    pub temporal: Option<TemporalRange>,
    /// May contain `*` and `?` wildcards.
    pub readable_granule_name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CmrError {
    #[error("CMR request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("CMR response is missing the {0} header")]
    MissingHeader(&'static str),
    #[error("CMR rejected the query: {0}")]
    Rejected(String),
}

impl SafeDisplay for CmrError {
    fn to_safe_string(&self) -> String {
        match self {
            CmrError::Rejected(message) => format!("CMR rejected the query: {message}"),
            _ => "Failed to query CMR".to_string(),
        }
    }
}

/// The slice of the CMR HTTP API the orchestrator needs: opening a scrolled
/// granule query so the query step can page through it.
#[async_trait]
pub trait CmrClient: Send + Sync {
    async fn start_granule_session(
        &self,
        query: &GranuleQuery,
        page_size: i32,
        token: Option<&str>,
    ) -> Result<GranuleSession, CmrError>;
}

pub struct HttpCmrClient {
    http: reqwest::Client,
    config: CmrConfig,
    client_id: String,
}

impl HttpCmrClient {
    pub fn new(config: &CmrConfig, client_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: config.clone(),
            client_id: client_id.to_string(),
        }
    }

    fn search_url(&self) -> Url {
        self.config
            .endpoint
            .join("/search/granules.json")
            .expect("valid CMR search URL")
    }
}

/// CMR pattern matching is only enabled when the name contains wildcards.
pub fn has_wildcards(name: &str) -> bool {
    name.contains('*') || name.contains('?')
}

#[async_trait]
impl CmrClient for HttpCmrClient {
    async fn start_granule_session(
        &self,
        query: &GranuleQuery,
        page_size: i32,
        token: Option<&str>,
    ) -> Result<GranuleSession, CmrError> {
        with_retries(
            "CMR granule session",
            &self.config.retries,
            || async {
                let mut form = reqwest::multipart::Form::new()
                    .text("scroll", "true")
                    .text("page_size", page_size.to_string());
                for collection in &query.collections {
                    form = form.text("collection_concept_id[]", collection.0.clone());
                }
                if let Some(temporal) = &query.temporal {
                    let start = temporal.start.map(|t| t.to_rfc3339()).unwrap_or_default();
                    let end = temporal.end.map(|t| t.to_rfc3339()).unwrap_or_default();
                    form = form.text("temporal", format!("{start},{end}"));
                }
                if let Some(name) = &query.readable_granule_name {
                    form = form.text("readable_granule_name[]", name.clone());
                    if has_wildcards(name) {
                        form = form.text("options[readable_granule_name][pattern]", "true");
                    }
                }

                let mut request = self
                    .http
                    .post(self.search_url())
                    .header("Client-Id", &self.client_id)
                    .multipart(form);
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }

                let response = request.send().await?;
                if !response.status().is_success() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(CmrError::Rejected(message));
                }

                let hits = response
                    .headers()
                    .get("CMR-Hits")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok())
                    .ok_or(CmrError::MissingHeader("CMR-Hits"))?;
                let scroll_id = response
                    .headers()
                    .get("CMR-Scroll-Id")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .ok_or(CmrError::MissingHeader("CMR-Scroll-Id"))?;

                Ok(GranuleSession { scroll_id, hits })
            },
            |error| matches!(error, CmrError::Http(_)),
        )
        .await
    }
}

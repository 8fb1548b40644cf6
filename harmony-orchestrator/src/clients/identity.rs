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

use crate::config::IdentityConfig;
use async_trait::async_trait;
use harmony_common::cache::TtlCache;
use harmony_common::retries::with_retries;
use harmony_common::SafeDisplay;
use serde::Deserialize;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Identity provider returned an unexpected response: {0}")]
    Unexpected(String),
}

impl SafeDisplay for IdentityError {
    fn to_safe_string(&self) -> String {
        match self {
            IdentityError::InvalidToken => "Invalid or expired token".to_string(),
            _ => "Failed to reach the identity provider".to_string(),
        }
    }
}

/// The identity provider operations the orchestrator relies on. Results of
/// the group and EULA lookups are cached with a bounded TTL; the caches are
/// capability objects owned by the client, not module state.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Resolves a bearer token to the username it belongs to.
    async fn validate_token(&self, token: &str) -> Result<String, IdentityError>;

    async fn user_groups(&self, username: &str) -> Result<Vec<String>, IdentityError>;

    /// Whether the user has accepted every EULA attached to the collection's
    /// provider.
    async fn has_accepted_eulas(&self, username: &str) -> Result<bool, IdentityError>;
}

pub struct HttpIdentityClient {
    http: reqwest::Client,
    config: IdentityConfig,
    groups_cache: TtlCache<String, Vec<String>>,
    eula_cache: TtlCache<String, bool>,
}

#[derive(Debug, Deserialize)]
struct TokenUserResponse {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    #[serde(default)]
    user_groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EulaResponse {
    #[serde(default)]
    accepted: bool,
}

impl HttpIdentityClient {
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: config.clone(),
            groups_cache: TtlCache::new(config.cache_ttl, 1024),
            eula_cache: TtlCache::new(config.cache_ttl, 1024),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.config.endpoint.join(path).expect("valid identity URL")
    }
}

#[async_trait]
impl IdentityClient for HttpIdentityClient {
    async fn validate_token(&self, token: &str) -> Result<String, IdentityError> {
        with_retries(
            "identity token validation",
            &self.config.retries,
            || async {
                let response = self
                    .http
                    .post(self.url("/oauth/tokens/user"))
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .form(&[("token", token)])
                    .send()
                    .await?;
                if response.status() == reqwest::StatusCode::UNAUTHORIZED
                    || response.status() == reqwest::StatusCode::FORBIDDEN
                {
                    return Err(IdentityError::InvalidToken);
                }
                if !response.status().is_success() {
                    return Err(IdentityError::Unexpected(format!(
                        "status {}",
                        response.status()
                    )));
                }
                let body: TokenUserResponse = response.json().await?;
                Ok(body.uid)
            },
            |error| matches!(error, IdentityError::Http(_)),
        )
        .await
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<String>, IdentityError> {
        self.groups_cache
            .get_or_insert_with(&username.to_string(), || async {
                let response = self
                    .http
                    .get(self.url(&format!("/api/user_groups/groups_for_user/{username}")))
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .send()
                    .await?
                    .error_for_status()?;
                let body: GroupsResponse = response.json().await?;
                Ok(body.user_groups.into_iter().map(|g| g.name).collect())
            })
            .await
    }

    async fn has_accepted_eulas(&self, username: &str) -> Result<bool, IdentityError> {
        self.eula_cache
            .get_or_insert_with(&username.to_string(), || async {
                let response = self
                    .http
                    .get(self.url(&format!("/api/users/{username}/verify_user_eula")))
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .send()
                    .await?
                    .error_for_status()?;
                let body: EulaResponse = response.json().await?;
                Ok(body.accepted)
            })
            .await
    }
}

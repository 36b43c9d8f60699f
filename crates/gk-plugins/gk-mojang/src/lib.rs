//! # gk-mojang
//!
//! `IdentityResolver` backed by a Mojang-compatible profile API and a
//! name-prefix search service.

use async_trait::async_trait;
use gk_core::error::{AppError, Result};
use gk_core::models::{AccountRef, GameAccount, GameAccountId};
use gk_core::traits::IdentityResolver;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const SERVICE: &str = "account lookup";

#[derive(Debug, Clone)]
pub struct MojangConfig {
    /// `GET {profile_url}/{name or id}`.
    pub profile_url: String,
    /// `GET {search_url}/{stem}`.
    pub search_url: String,
    /// Tries per lookup when the body cannot be decoded.
    pub attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

pub struct MojangResolver {
    http: Client,
    config: MojangConfig,
}

impl MojangResolver {
    pub fn new(config: MojangConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("gatekeeper/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn url(base: &str, segment: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), segment)
    }
}

/// Profile payload. Mirrors and proxies of the profile API disagree on field
/// names, so the common spellings are all accepted.
#[derive(Debug, Default, Deserialize)]
struct ProfileBody {
    #[serde(default, alias = "uuid", alias = "playerUuid")]
    id: Option<String>,
    #[serde(default, alias = "username", alias = "playerName")]
    name: Option<String>,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

impl ProfileBody {
    fn into_account(self) -> Result<GameAccount> {
        if let Some(message) = self.error_message {
            return Err(AppError::external(SERVICE, message));
        }
        let id = self.id.as_deref().and_then(GameAccountId::parse);
        match (id, self.name) {
            (Some(id), Some(name)) if !name.is_empty() => Ok(GameAccount {
                id,
                display_name: name,
            }),
            _ => Err(AppError::external(SERVICE, "profile without a usable id and name")),
        }
    }
}

#[async_trait]
impl IdentityResolver for MojangResolver {
    async fn lookup(&self, reference: &AccountRef) -> Result<Option<GameAccount>> {
        let identifier = match reference {
            AccountRef::Id(id) => id.to_string(),
            AccountRef::Name(name) => name.to_lowercase(),
        };
        let url = Self::url(&self.config.profile_url, &identifier);

        for attempt in 1..=self.config.attempts {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| AppError::external(SERVICE, e))?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            let body = response
                .text()
                .await
                .map_err(|e| AppError::external(SERVICE, e))?;

            match serde_json::from_str::<ProfileBody>(&body) {
                Ok(profile) => return profile.into_account().map(Some),
                Err(e) => {
                    warn!(%identifier, %status, attempt, error = %e, "undecodable profile response");
                    if attempt < self.config.attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        debug!(%identifier, "giving up on profile lookup");
        Ok(None)
    }

    async fn search_prefix(&self, stem: &str) -> Result<Vec<GameAccount>> {
        let stem = stem.trim().to_lowercase();
        if stem.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .get(Self::url(&self.config.search_url, &stem))
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, e))?;
        if response.status() != StatusCode::OK {
            warn!(%stem, status = %response.status(), "name search failed");
            return Ok(Vec::new());
        }
        let profiles: Vec<ProfileBody> = response
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, e))?;
        Ok(profiles
            .into_iter()
            .filter_map(|profile| profile.into_account().ok())
            .collect())
    }
}

//! # gk-hypixel
//!
//! `ReputationGate` backed by the Hypixel player API. The published chat handle
//! comes from the player's social links; the rank from the package and staff
//! rank fields.

use async_trait::async_trait;
use gk_core::error::{AppError, Result};
use gk_core::models::{GameAccountId, Rank, ReputationProfile};
use gk_core::traits::ReputationGate;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Proxy, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "reputation";

/// Used when a 429 carries no usable header.
const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

pub struct HypixelConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

pub struct HypixelGate {
    http: Client,
    base_url: String,
    api_key: SecretString,
}

impl HypixelGate {
    pub fn new(config: HypixelConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .user_agent(concat!("gatekeeper/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout);
        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            let proxy = Proxy::all(proxy)
                .map_err(|e| AppError::Internal(format!("invalid reputation proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let http = builder
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PlayerResponse {
    #[serde(default)]
    cause: Option<String>,
    #[serde(default)]
    player: Option<Player>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Player {
    rank: Option<String>,
    monthly_package_rank: Option<String>,
    new_package_rank: Option<String>,
    package_rank: Option<String>,
    social_media: Option<SocialMedia>,
}

#[derive(Debug, Default, Deserialize)]
struct SocialMedia {
    #[serde(default)]
    links: HashMap<String, String>,
}

impl Player {
    fn handle(&self) -> Option<String> {
        self.social_media
            .as_ref()
            .and_then(|social| social.links.get("DISCORD"))
            .map(|handle| handle.trim().to_string())
            .filter(|handle| !handle.is_empty())
    }
}

/// Highest rank the player holds. Staff ranks outrank purchased ones.
fn classify_rank(player: &Player) -> Rank {
    fn set(field: &Option<String>) -> Option<&str> {
        field
            .as_deref()
            .filter(|value| !matches!(*value, "NONE" | "NORMAL"))
    }

    match set(&player.rank) {
        Some("YOUTUBER") => return Rank::YouTuber,
        Some(_) => return Rank::Staff,
        None => {}
    }
    if set(&player.monthly_package_rank) == Some("SUPERSTAR") {
        return Rank::MvpPlusPlus;
    }
    match set(&player.new_package_rank).or_else(|| set(&player.package_rank)) {
        Some("MVP_PLUS") => Rank::MvpPlus,
        Some("MVP") => Rank::Mvp,
        Some("VIP_PLUS") => Rank::VipPlus,
        Some("VIP") => Rank::Vip,
        _ => Rank::Default,
    }
}

fn backoff(headers: &HeaderMap) -> Duration {
    [RETRY_AFTER.as_str(), "ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_BACKOFF)
}

#[async_trait]
impl ReputationGate for HypixelGate {
    async fn profile(&self, account: &GameAccountId) -> Result<ReputationProfile> {
        let response = self
            .http
            .get(format!("{}/v2/player", self.base_url))
            .query(&[("uuid", account.as_str())])
            .header("API-Key", self.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited {
                service: SERVICE,
                retry_after: backoff(response.headers()),
            });
        }
        let body: PlayerResponse = response
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("{status}: {e}")))?;
        if let Some(cause) = body.cause {
            return Err(AppError::external(SERVICE, cause));
        }
        if !status.is_success() {
            return Err(AppError::external(SERVICE, status));
        }

        let player = body.player.unwrap_or_default();
        let profile = ReputationProfile {
            account_id: account.clone(),
            handle: player.handle(),
            rank: classify_rank(&player),
        };
        debug!(account = %account, rank = ?profile.rank, linked = profile.handle.is_some(), "reputation fetched");
        Ok(profile)
    }
}

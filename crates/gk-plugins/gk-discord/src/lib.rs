//! # gk-discord
//!
//! The chat platform over its REST API. One client implements the member
//! directory, the moderation gateway, the audit trail and the notifier.

mod render;
mod wire;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gk_core::error::{AppError, Result};
use gk_core::models::{
    AuditAction, AuditEntry, CommandLog, HistoryWindow, Member, ModerationNotice, OperatorAlert,
    PlatformId, PunishmentRecord, RoleId,
};
use gk_core::traits::{AuditTrail, MemberDirectory, ModerationGateway, Notifier};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use wire::{
    AuditLogDto, BanBody, Embed, MemberDto, MessageBody, NickBody, RateLimitDto, TimeoutBody,
};

const SERVICE: &str = "chat platform";

/// Largest page the member list endpoint serves.
const MEMBER_PAGE: usize = 1000;

/// Upper bound the audit-log endpoint accepts.
const AUDIT_PAGE_MAX: usize = 100;

const MAX_BACKOFF_SECS: f64 = 3600.0;

#[derive(Debug)]
pub struct DiscordConfig {
    pub api_base: String,
    pub token: SecretString,
    pub guild_id: u64,
    pub timeout: Duration,
    pub log_channel: Option<u64>,
    pub operator_channel: Option<u64>,
    pub staff_channel: Option<u64>,
    pub command_log_channel: Option<u64>,
}

pub struct DiscordClient {
    http: Client,
    base: String,
    guild: u64,
    log_channel: Option<u64>,
    operator_channel: Option<u64>,
    staff_channel: Option<u64>,
    command_log_channel: Option<u64>,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bot {}", config.token.expose_secret()))
            .map_err(|_| AppError::Internal("bot token is not a valid header value".into()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .user_agent(concat!("DiscordBot (gatekeeper, ", env!("CARGO_PKG_VERSION"), ")"))
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base: config.api_base.trim_end_matches('/').to_string(),
            guild: config.guild_id,
            log_channel: config.log_channel,
            operator_channel: config.operator_channel,
            staff_channel: config.staff_channel,
            command_log_channel: config.command_log_channel,
        })
    }

    fn request(&self, method: Method, path: &str, reason: Option<&str>) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{path}", self.base));
        match reason {
            Some(reason) => builder.header("X-Audit-Log-Reason", audit_reason(reason)),
            None => builder,
        }
    }

    /// Sends and maps failure statuses. `action` names the attempt for permission errors.
    async fn send(&self, builder: RequestBuilder, action: &str) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(failure(status, action, response).await)
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder, action: &str) -> Result<T> {
        self.send(builder, action)
            .await?
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, format!("{action}: {e}")))
    }

    /// Edits that fail with 404 mean the member left.
    async fn member_edit(&self, id: PlatformId, builder: RequestBuilder, action: &str) -> Result<()> {
        match self.send(builder, action).await {
            Err(AppError::ExternalService { message, .. }) if message.starts_with("404") => {
                Err(AppError::MemberNotFound { platform_id: id })
            }
            other => other.map(|_| ()),
        }
    }

    async fn post_embed(&self, channel: Option<u64>, embed: Embed) -> Result<()> {
        let Some(channel) = channel else {
            debug!(title = %embed.title, "no channel configured, notice dropped");
            return Ok(());
        };
        let path = format!("/channels/{channel}/messages");
        let body = MessageBody {
            content: None,
            embeds: vec![embed.clone()],
        };
        let first = self
            .send(self.request(Method::POST, &path, None).json(&body), "send messages")
            .await;
        match first {
            Ok(_) => Ok(()),
            Err(e) if embed.description.is_some() && matches!(e, AppError::ExternalService { .. }) => {
                warn!(channel, error = %e, "embed rejected, retrying without its description");
                let body = MessageBody {
                    content: None,
                    embeds: vec![Embed {
                        description: None,
                        ..embed
                    }],
                };
                self.send(self.request(Method::POST, &path, None).json(&body), "send messages")
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

async fn failure(status: StatusCode, action: &str, response: Response) -> AppError {
    let header_backoff = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok());
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::FORBIDDEN => AppError::Permission {
            action: action.to_string(),
            message: body,
        },
        StatusCode::TOO_MANY_REQUESTS => {
            let body_backoff = serde_json::from_str::<RateLimitDto>(&body)
                .map(|dto| dto.retry_after)
                .ok();
            AppError::RateLimited {
                service: SERVICE,
                retry_after: backoff(body_backoff, header_backoff),
            }
        }
        _ => AppError::external(SERVICE, format!("{} {action}: {body}", status.as_u16())),
    }
}

/// Prefers the body's hint, then the header's; anything not finite is ignored.
fn backoff(body: Option<f64>, header: Option<f64>) -> Duration {
    let seconds = body
        .filter(|s| s.is_finite())
        .or(header.filter(|s| s.is_finite()))
        .unwrap_or(1.0);
    Duration::from_secs_f64(seconds.clamp(0.0, MAX_BACKOFF_SECS))
}

/// Audit-log reasons travel URL-encoded in a header.
fn audit_reason(reason: &str) -> String {
    urlencoding::encode(reason).into_owned()
}

#[async_trait]
impl MemberDirectory for DiscordClient {
    async fn member(&self, id: PlatformId) -> Result<Option<Member>> {
        let path = format!("/guilds/{}/members/{id}", self.guild);
        let response = self
            .request(Method::GET, &path, None)
            .send()
            .await
            .map_err(|e| AppError::external(SERVICE, e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(failure(status, "read members", response).await);
        }
        let dto: MemberDto = response
            .json()
            .await
            .map_err(|e| AppError::external(SERVICE, e))?;
        Ok(Some(dto.into()))
    }

    async fn member_ids(&self) -> Result<Vec<PlatformId>> {
        let path = format!("/guilds/{}/members", self.guild);
        let mut ids = Vec::new();
        let mut after = 0u64;
        loop {
            let page: Vec<MemberDto> = self
                .json(
                    self.request(Method::GET, &path, None)
                        .query(&[("limit", MEMBER_PAGE as u64), ("after", after)]),
                    "list members",
                )
                .await?;
            let full = page.len() == MEMBER_PAGE;
            ids.extend(page.into_iter().map(|dto| dto.user.id.0));
            match ids.last() {
                Some(&last) if full => after = last,
                _ => break,
            }
        }
        debug!(members = ids.len(), "member list fetched");
        Ok(ids)
    }

    async fn add_role(&self, id: PlatformId, role: RoleId) -> Result<()> {
        let path = format!("/guilds/{}/members/{id}/roles/{role}", self.guild);
        self.member_edit(id, self.request(Method::PUT, &path, None), "manage roles")
            .await
    }

    async fn remove_role(&self, id: PlatformId, role: RoleId) -> Result<()> {
        let path = format!("/guilds/{}/members/{id}/roles/{role}", self.guild);
        self.member_edit(id, self.request(Method::DELETE, &path, None), "manage roles")
            .await
    }

    async fn set_nickname(&self, id: PlatformId, nickname: Option<String>) -> Result<()> {
        let path = format!("/guilds/{}/members/{id}", self.guild);
        let builder = self
            .request(Method::PATCH, &path, None)
            .json(&NickBody { nick: nickname });
        self.member_edit(id, builder, "manage nicknames").await
    }
}

#[async_trait]
impl ModerationGateway for DiscordClient {
    async fn ban(
        &self,
        target: PlatformId,
        history: HistoryWindow,
        reason: Option<String>,
    ) -> Result<()> {
        let path = format!("/guilds/{}/bans/{target}", self.guild);
        let builder = self
            .request(Method::PUT, &path, reason.as_deref())
            .json(&BanBody {
                delete_message_seconds: history.as_seconds(),
            });
        self.send(builder, "ban members").await.map(|_| ())
    }

    async fn unban(&self, target: PlatformId, reason: Option<String>) -> Result<()> {
        let path = format!("/guilds/{}/bans/{target}", self.guild);
        self.send(
            self.request(Method::DELETE, &path, reason.as_deref()),
            "ban members",
        )
        .await
        .map(|_| ())
    }

    async fn timeout(
        &self,
        target: PlatformId,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<()> {
        let path = format!("/guilds/{}/members/{target}", self.guild);
        let builder = self
            .request(Method::PATCH, &path, reason.as_deref())
            .json(&TimeoutBody {
                communication_disabled_until: until,
            });
        self.member_edit(target, builder, "moderate members").await
    }
}

#[async_trait]
impl AuditTrail for DiscordClient {
    async fn recent(&self, action: AuditAction, limit: usize) -> Result<Vec<AuditEntry>> {
        let Some(action_type) = wire::action_type(action) else {
            return Ok(Vec::new());
        };
        let path = format!("/guilds/{}/audit-logs", self.guild);
        let log: AuditLogDto = self
            .json(
                self.request(Method::GET, &path, None).query(&[
                    ("action_type", action_type as usize),
                    ("limit", limit.clamp(1, AUDIT_PAGE_MAX)),
                ]),
                "view audit log",
            )
            .await?;
        Ok(log
            .audit_log_entries
            .into_iter()
            .map(AuditEntry::from)
            .filter(|entry| entry.action == action)
            .collect())
    }
}

#[async_trait]
impl Notifier for DiscordClient {
    async fn moderation_notice(&self, notice: ModerationNotice) -> Result<()> {
        self.post_embed(self.log_channel, render::notice(&notice)).await
    }

    async fn missing_reason(&self, record: PunishmentRecord) -> Result<()> {
        self.post_embed(self.staff_channel, render::missing_reason(&record))
            .await
    }

    async fn operator_alert(&self, alert: OperatorAlert) -> Result<()> {
        self.post_embed(self.operator_channel, render::operator_alert(&alert))
            .await
    }

    async fn command_log(&self, entry: CommandLog) -> Result<()> {
        self.post_embed(self.command_log_channel, render::command_log(&entry))
            .await
    }
}

//! REST payloads and their mapping onto the core models.

use chrono::{DateTime, Utc};
use gk_core::models::{snowflake_timestamp, AuditAction, AuditEntry, Member, TimeoutChange};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Snowflakes travel as JSON strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Snowflake(pub u64);

impl TryFrom<String> for Snowflake {
    type Error = std::num::ParseIntError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map(Snowflake)
    }
}

#[derive(Debug, Deserialize)]
pub struct UserDto {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Deserialize)]
pub struct MemberDto {
    pub user: UserDto,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
}

impl From<MemberDto> for Member {
    fn from(dto: MemberDto) -> Self {
        Member {
            id: dto.user.id.0,
            handle: dto.user.username,
            nickname: dto.nick,
            roles: dto.roles.into_iter().map(|role| role.0).collect(),
            is_bot: dto.user.bot,
        }
    }
}

/// `action_type` values of the audit-log endpoint.
pub fn action_type(action: AuditAction) -> Option<u8> {
    match action {
        AuditAction::MemberRemoval => Some(20),
        AuditAction::Ban => Some(22),
        AuditAction::Unban => Some(23),
        AuditAction::MemberUpdate => Some(24),
        AuditAction::Other => None,
    }
}

fn action_from_type(kind: u8) -> AuditAction {
    match kind {
        20 => AuditAction::MemberRemoval,
        22 => AuditAction::Ban,
        23 => AuditAction::Unban,
        24 => AuditAction::MemberUpdate,
        _ => AuditAction::Other,
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditLogDto {
    #[serde(default)]
    pub audit_log_entries: Vec<AuditEntryDto>,
}

#[derive(Debug, Deserialize)]
pub struct AuditEntryDto {
    pub id: Snowflake,
    pub action_type: u8,
    #[serde(default)]
    pub user_id: Option<Snowflake>,
    #[serde(default)]
    pub target_id: Option<Snowflake>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub changes: Vec<ChangeDto>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeDto {
    pub key: String,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
}

fn timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc))
}

impl From<AuditEntryDto> for AuditEntry {
    fn from(dto: AuditEntryDto) -> Self {
        let timeout = dto
            .changes
            .iter()
            .find(|change| change.key == "communication_disabled_until")
            .map(|change| TimeoutChange {
                before: timestamp(change.old_value.as_ref()),
                after: timestamp(change.new_value.as_ref()),
            });
        AuditEntry {
            id: dto.id.0,
            action: action_from_type(dto.action_type),
            actor_id: dto.user_id.map(|id| id.0),
            target_id: dto.target_id.map(|id| id.0),
            reason: dto.reason,
            created_at: snowflake_timestamp(dto.id.0),
            timeout,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BanBody {
    pub delete_message_seconds: u32,
}

#[derive(Debug, Serialize)]
pub struct NickBody {
    pub nick: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TimeoutBody {
    pub communication_disabled_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct MessageBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
}

/// Body of a 429 response.
#[derive(Debug, Deserialize)]
pub struct RateLimitDto {
    pub retry_after: f64,
}

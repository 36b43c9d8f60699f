//! # Domain Models
//!
//! Identity links between the chat platform and the game, the punishment ledger,
//! and the audit entries the ledger is reconciled against.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::filter::Document;

/// Numeric identity on the chat platform (a snowflake).
pub type PlatformId = u64;

/// Role identifier on the chat platform.
pub type RoleId = u64;

/// Identifier of an entry in the platform's audit trail. Snowflakes, so they sort by time.
pub type AuditId = u64;

/// Milliseconds between the Unix epoch and the platform's snowflake epoch.
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Creation time encoded in a snowflake identifier.
pub fn snowflake_timestamp(id: u64) -> DateTime<Utc> {
    let millis = (id >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("`{0}` is not a canonical game account id")]
pub struct InvalidAccountId(pub String);

/// Canonical game-account identifier: 32 lowercase hex digits without dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GameAccountId(String);

impl GameAccountId {
    /// Accepts both the compact and the dashed 8-4-4-4-12 forms, in any case.
    pub fn parse(raw: &str) -> Option<Self> {
        let compact: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if compact.len() == 32 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(compact))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn hyphenated(&self) -> String {
        let s = &self.0;
        format!("{}-{}-{}-{}-{}", &s[..8], &s[8..12], &s[12..16], &s[16..20], &s[20..])
    }
}

impl fmt::Display for GameAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for GameAccountId {
    type Error = InvalidAccountId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or(InvalidAccountId(value))
    }
}

impl From<GameAccountId> for String {
    fn from(id: GameAccountId) -> Self {
        id.0
    }
}

/// A parsed, human-entered account reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    Id(GameAccountId),
    Name(String),
}

impl AccountRef {
    /// ID-shaped input bypasses name resolution. Anything that is neither an id nor
    /// a legal account name (`[A-Za-z0-9_]{3,16}`) cannot match an account.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.len() > 16 {
            if let Some(id) = GameAccountId::parse(input) {
                return Some(Self::Id(id));
            }
        }
        let legal_name = (3..=16).contains(&input.len())
            && input.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        legal_name.then(|| Self::Name(input.to_string()))
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A resolved game account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameAccount {
    pub id: GameAccountId,
    pub display_name: String,
}

/// Rank tiers reported by the reputation service, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Default,
    Vip,
    VipPlus,
    Mvp,
    MvpPlus,
    MvpPlusPlus,
    YouTuber,
    Staff,
}

impl FromStr for Rank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" | "none" => Ok(Self::Default),
            "vip" => Ok(Self::Vip),
            "vip_plus" | "vip+" => Ok(Self::VipPlus),
            "mvp" => Ok(Self::Mvp),
            "mvp_plus" | "mvp+" => Ok(Self::MvpPlus),
            "mvp_plus_plus" | "mvp++" => Ok(Self::MvpPlusPlus),
            "youtuber" | "you_tuber" => Ok(Self::YouTuber),
            "staff" => Ok(Self::Staff),
            other => Err(format!("unknown rank `{other}`")),
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "Default",
            Self::Vip => "VIP",
            Self::VipPlus => "VIP+",
            Self::Mvp => "MVP",
            Self::MvpPlus => "MVP+",
            Self::MvpPlusPlus => "MVP++",
            Self::YouTuber => "YouTuber",
            Self::Staff => "Staff",
        })
    }
}

/// Attribute record fetched from the reputation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationProfile {
    pub account_id: GameAccountId,
    /// Free-text chat-platform handle the account owner published, if any.
    pub handle: Option<String>,
    pub rank: Rank,
}

/// How a link came to exist. An override always carries its reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum LinkSource {
    SelfService,
    ManualOverride {
        override_reason: String,
        overridden_by: PlatformId,
    },
}

/// One edge of the partial bijection between platform members and game accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub platform_id: PlatformId,
    pub game_account_id: GameAccountId,
    /// Last known game name, kept for presentation only.
    pub display_name: String,
    pub linked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub source: LinkSource,
}

impl IdentityLink {
    pub fn self_service(platform_id: PlatformId, account: &GameAccount) -> Self {
        Self {
            platform_id,
            game_account_id: account.id.clone(),
            display_name: account.display_name.clone(),
            linked_at: Utc::now(),
            source: LinkSource::SelfService,
        }
    }

    pub fn manual_override(
        platform_id: PlatformId,
        account: &GameAccount,
        staff: PlatformId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            platform_id,
            game_account_id: account.id.clone(),
            display_name: account.display_name.clone(),
            linked_at: Utc::now(),
            source: LinkSource::ManualOverride {
                override_reason: reason.into(),
                overridden_by: staff,
            },
        }
    }

    pub fn account(&self) -> GameAccount {
        GameAccount {
            id: self.game_account_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

impl Document for IdentityLink {
    const COLLECTION: &'static str = "identity_links";
    const UNIQUE_FIELDS: &'static [&'static str] = &["game_account_id"];

    fn key(&self) -> String {
        self.platform_id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentKind {
    Ban,
}

impl PunishmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub closed_audit_id: AuditId,
    pub closed_by: Option<PlatformId>,
    pub close_reason: Option<String>,
    pub closed_at: DateTime<Utc>,
}

/// One punishment lifecycle, keyed by the audit entry that opened it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    pub audit_id: AuditId,
    pub kind: PunishmentKind,
    pub target_platform_id: PlatformId,
    pub game_account_id: Option<GameAccountId>,
    pub opened_at: DateTime<Utc>,
    /// `None` when only the audit trail knows about the action.
    pub opened_by: Option<PlatformId>,
    pub reason: Option<String>,
    pub closure: Option<Closure>,
}

impl PunishmentRecord {
    pub fn is_open(&self) -> bool {
        self.closure.is_none()
    }
}

impl Document for PunishmentRecord {
    const COLLECTION: &'static str = "punishments";

    fn key(&self) -> String {
        self.audit_id.to_string()
    }
}

/// Kinds of audit entries the reconciliation cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Ban,
    Unban,
    MemberUpdate,
    /// A member left the guild through a staff action; kick or ban cannot be told apart.
    MemberRemoval,
    #[serde(other)]
    Other,
}

/// Timeout expiry before and after a member update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutChange {
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
}

impl TimeoutChange {
    /// A change that leaves the member timed out past `at` is a mute, anything else an unmute.
    pub fn is_mute(&self, at: DateTime<Utc>) -> bool {
        self.after.is_some_and(|after| after > at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub action: AuditAction,
    pub actor_id: Option<PlatformId>,
    pub target_id: Option<PlatformId>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub timeout: Option<TimeoutChange>,
}

/// A chat-platform guild member as seen through the member directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: PlatformId,
    /// Unique account handle (not the display name).
    pub handle: String,
    /// Guild nickname, if one is set.
    pub nickname: Option<String>,
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub is_bot: bool,
}

/// The identity a verification is performed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: PlatformId,
    pub handle: String,
}

impl From<&Member> for Caller {
    fn from(member: &Member) -> Self {
        Self {
            id: member.id,
            handle: member.handle.clone(),
        }
    }
}

/// How much message history a ban removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryWindow {
    #[default]
    None,
    OneHour,
    SixHours,
    TwelveHours,
    OneDay,
    ThreeDays,
    SevenDays,
}

impl HistoryWindow {
    pub fn as_seconds(&self) -> u32 {
        const HOUR: u32 = 3600;
        match self {
            Self::None => 0,
            Self::OneHour => HOUR,
            Self::SixHours => 6 * HOUR,
            Self::TwelveHours => 12 * HOUR,
            Self::OneDay => 24 * HOUR,
            Self::ThreeDays => 72 * HOUR,
            Self::SevenDays => 168 * HOUR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuteDuration {
    OneMinute,
    FiveMinutes,
    TenMinutes,
    OneHour,
    OneDay,
    OneWeek,
}

impl MuteDuration {
    pub fn as_duration(&self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::TenMinutes => Duration::minutes(10),
            Self::OneHour => Duration::hours(1),
            Self::OneDay => Duration::days(1),
            Self::OneWeek => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Ban,
    Unban,
    Mute,
    Unmute,
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ban => "Ban",
            Self::Unban => "Unban",
            Self::Mute => "Mute",
            Self::Unmute => "Unmute",
        })
    }
}

/// Everything the moderation log needs to describe one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationNotice {
    pub action: ModerationAction,
    pub target: PlatformId,
    pub game_account: Option<GameAccount>,
    pub actor: Option<PlatformId>,
    pub reason: Option<String>,
    pub audit_id: Option<AuditId>,
    /// Previous timeout expiry, for mute/unmute entries.
    pub previous_expiry: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// A command that completed, as recorded in the command log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLog {
    pub invoker: PlatformId,
    pub invoker_handle: String,
    /// The command as the invoker would have typed it, options included.
    pub command: String,
    pub reply_title: String,
    pub reply_message: String,
    pub occurred_at: DateTime<Utc>,
}

/// A message for the operator channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub title: String,
    pub detail: String,
}

/// Returns `None` for absent or whitespace-only text.
pub fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

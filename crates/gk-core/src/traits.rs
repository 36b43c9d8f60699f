//! # Core Traits (Ports)
//!
//! Every external collaborator the engines talk to. Plugins implement these and the
//! binary injects them; the engines never look anything up by name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::filter::{Document, Filter, Sort};
use crate::models::{
    AccountRef, AuditAction, AuditEntry, CommandLog, GameAccount, GameAccountId, HistoryWindow,
    IdentityLink, Member, ModerationNotice, OperatorAlert, PlatformId, PunishmentRecord,
    ReputationProfile, RoleId,
};

/// Game-account lookup service.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Ok(None)` means the service answered and no such account exists.
    async fn lookup(&self, reference: &AccountRef) -> Result<Option<GameAccount>>;

    /// Accounts whose name starts with `stem`, for autocomplete.
    async fn search_prefix(&self, stem: &str) -> Result<Vec<GameAccount>>;
}

/// Game reputation service.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ReputationGate: Send + Sync {
    async fn profile(&self, account: &GameAccountId) -> Result<ReputationProfile>;
}

/// Key-based document persistence.
#[async_trait]
pub trait DocumentStore<D: Document>: Send + Sync {
    /// Inserts or replaces the whole document under its key.
    async fn upsert(&self, doc: &D) -> std::result::Result<(), StoreError>;

    /// Inserts only if neither the key nor a unique field is taken; otherwise
    /// fails with [`StoreError::DuplicateKey`] and leaves the stored document alone.
    async fn insert_new(&self, doc: &D) -> std::result::Result<(), StoreError>;

    async fn find_one(&self, filter: &Filter) -> std::result::Result<Option<D>, StoreError>;

    async fn find_many(
        &self,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<D>, StoreError>;

    /// Deletes the first match and returns it.
    async fn delete_one(&self, filter: &Filter) -> std::result::Result<Option<D>, StoreError>;

    async fn delete_many(&self, filter: &Filter) -> std::result::Result<u64, StoreError>;
}

pub type LinkStore = dyn DocumentStore<IdentityLink>;
pub type PunishmentStore = dyn DocumentStore<PunishmentRecord>;

/// Guild membership as exposed by the chat platform.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn member(&self, id: PlatformId) -> Result<Option<Member>>;

    /// Every member id in the guild, for the periodic sweep.
    async fn member_ids(&self) -> Result<Vec<PlatformId>>;

    async fn add_role(&self, id: PlatformId, role: RoleId) -> Result<()>;

    async fn remove_role(&self, id: PlatformId, role: RoleId) -> Result<()>;

    /// `None` resets the nickname.
    async fn set_nickname(&self, id: PlatformId, nickname: Option<String>) -> Result<()>;
}

/// Punishments executed against the chat platform.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ModerationGateway: Send + Sync {
    async fn ban(
        &self,
        target: PlatformId,
        history: HistoryWindow,
        reason: Option<String>,
    ) -> Result<()>;

    async fn unban(&self, target: PlatformId, reason: Option<String>) -> Result<()>;

    /// `None` lifts an active timeout.
    async fn timeout(
        &self,
        target: PlatformId,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<()>;
}

/// The platform's own audit trail, newest entries first.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn recent(&self, action: AuditAction, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Outbound notices: the moderation and command logs, staff escalations and the
/// operator channel.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn moderation_notice(&self, notice: ModerationNotice) -> Result<()>;

    /// Asks staff to supply a reason for a punishment recorded without one.
    async fn missing_reason(&self, record: PunishmentRecord) -> Result<()>;

    async fn operator_alert(&self, alert: OperatorAlert) -> Result<()>;

    async fn command_log(&self, entry: CommandLog) -> Result<()>;
}

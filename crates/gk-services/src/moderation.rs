//! # ReconciliationEngine
//!
//! Keeps the punishment ledger consistent with what actually happened on the
//! platform, whether a punishment arrived through a bot command or was applied by
//! hand and only shows up in the audit trail.
//!
//! Per target a ban moves `NONE → OPEN → CLOSED`; a closed target may open again
//! under a new audit id. Transitions for one target are serialized by a keyed lock.
//! Mutes carry no stored state and are only logged, once per audit entry.

use chrono::{DateTime, Utc};
use gk_core::error::{AppError, IntegrityViolation, Result, StoreError};
use gk_core::filter::{Filter, Sort};
use gk_core::models::{
    non_blank, AuditAction, AuditEntry, AuditId, Closure, GameAccount, HistoryWindow,
    ModerationAction, ModerationNotice, MuteDuration, PlatformId, PunishmentKind,
    PunishmentRecord,
};
use gk_core::traits::{AuditTrail, LinkStore, ModerationGateway, Notifier, PunishmentStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::correlation::{Claim, ClaimRegistry, SeenAudits};
use crate::locks::KeyedLocks;

#[derive(Debug, Clone)]
pub struct ModerationSettings {
    /// The bot's own platform identity.
    pub bot_id: PlatformId,
    /// How far back an audit entry may lie to be correlated with a signal.
    pub lookback: Duration,
    pub correlation_attempts: u32,
    pub correlation_delay: Duration,
    /// Entries fetched per audit-trail poll.
    pub audit_page: usize,
    /// Drop notifications performed by the bot even when no claim covers them.
    pub suppress_bot_actor: bool,
    /// How long a finished command keeps catching its own late notifications.
    pub claim_grace: Duration,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            bot_id: 0,
            lookback: Duration::from_secs(60),
            correlation_attempts: 5,
            correlation_delay: Duration::from_secs(1),
            audit_page: 10,
            suppress_bot_actor: true,
            claim_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRequest {
    pub actor: PlatformId,
    pub target: PlatformId,
    pub reason: Option<String>,
    pub history: HistoryWindow,
    /// Known when the platform reported the audit entry with the command.
    pub audit_id: Option<AuditId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbanRequest {
    pub actor: PlatformId,
    pub target: PlatformId,
    pub reason: Option<String>,
    pub audit_id: Option<AuditId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuteRequest {
    pub actor: PlatformId,
    pub target: PlatformId,
    pub duration: MuteDuration,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmuteRequest {
    pub actor: PlatformId,
    pub target: PlatformId,
    pub reason: Option<String>,
}

/// Why a notification was dropped without touching the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// A running or just-completed command owns it.
    Claimed,
    BotActor,
    /// The mute or unmute was already logged.
    SeenBefore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Opened(PunishmentRecord),
    Closed(PunishmentRecord),
    /// The audit id is already on record.
    Duplicate(AuditId),
    Suppressed(Suppression),
    Logged(ModerationNotice),
    Ignored,
}

pub struct ReconciliationEngine {
    gateway: Arc<dyn ModerationGateway>,
    audit: Arc<dyn AuditTrail>,
    punishments: Arc<PunishmentStore>,
    links: Arc<LinkStore>,
    notifier: Arc<dyn Notifier>,
    settings: ModerationSettings,
    locks: KeyedLocks<PlatformId>,
    claims: ClaimRegistry,
    seen: SeenAudits,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn ModerationGateway>,
        audit: Arc<dyn AuditTrail>,
        punishments: Arc<PunishmentStore>,
        links: Arc<LinkStore>,
        notifier: Arc<dyn Notifier>,
        settings: ModerationSettings,
    ) -> Self {
        let claims = ClaimRegistry::new(settings.claim_grace);
        let seen = SeenAudits::new(settings.lookback.max(Duration::from_secs(600)), 1024);
        Self {
            gateway,
            audit,
            punishments,
            links,
            notifier,
            settings,
            locks: KeyedLocks::new(),
            claims,
            seen,
        }
    }

    /// Bans the target on the platform and opens a record for it.
    pub async fn ban(&self, request: BanRequest) -> Result<PunishmentRecord> {
        let target = request.target;
        let _guard = self.locks.lock(target).await;
        if let Some(open) = self.open_record(target).await? {
            return Err(AppError::AlreadyPunished {
                target,
                audit_id: open.audit_id,
            });
        }

        let reason = non_blank(request.reason.as_deref()).map(str::to_string);
        let claim = self.claims.claim(target, ModerationAction::Ban);
        self.gateway
            .ban(target, request.history, reason.clone())
            .await?;

        let audit_id = match request.audit_id.or_else(|| claim.delivered()) {
            Some(id) => id,
            None => self.correlate(AuditAction::Ban, target, Some(&claim)).await?,
        };
        let account = self.linked_account(target).await;
        let record = PunishmentRecord {
            audit_id,
            kind: PunishmentKind::Ban,
            target_platform_id: target,
            game_account_id: account.as_ref().map(|a| a.id.clone()),
            opened_at: Utc::now(),
            opened_by: Some(request.actor),
            reason,
            closure: None,
        };

        match self.punishments.insert_new(&record).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                warn!(member = target, audit_id, "ban already recorded by another writer");
                let stored = self
                    .punishments
                    .find_one(&Filter::eq("audit_id", audit_id))
                    .await?
                    .ok_or_else(|| {
                        AppError::Internal(format!("ban {audit_id} collided but is not stored"))
                    })?;
                claim.complete();
                return Ok(stored);
            }
            Err(e) => return Err(e.into()),
        }
        claim.complete();

        info!(member = target, audit_id, actor = request.actor, "ban recorded");
        self.announce_open(&record, account).await;
        Ok(record)
    }

    /// Lifts the target's ban. Refused without touching the platform when no ban is open.
    pub async fn unban(&self, request: UnbanRequest) -> Result<PunishmentRecord> {
        let target = request.target;
        let _guard = self.locks.lock(target).await;
        let Some(open) = self.open_record(target).await? else {
            error!(member = target, "unban requested with no open ban on record");
            return Err(IntegrityViolation::NoOpenPunishment { target }.into());
        };

        let reason = non_blank(request.reason.as_deref()).map(str::to_string);
        let claim = self.claims.claim(target, ModerationAction::Unban);
        self.gateway.unban(target, reason.clone()).await?;

        let audit_id = match request.audit_id.or_else(|| claim.delivered()) {
            Some(id) => id,
            None => {
                self.correlate(AuditAction::Unban, target, Some(&claim))
                    .await?
            }
        };
        let closed = close(open, audit_id, Some(request.actor), reason);
        self.punishments.upsert(&closed).await?;
        claim.complete();

        info!(member = target, audit_id, actor = request.actor, "ban closed");
        self.announce_close(&closed).await;
        Ok(closed)
    }

    pub async fn mute(&self, request: MuteRequest) -> Result<ModerationNotice> {
        let reason = non_blank(request.reason.as_deref()).map(str::to_string);
        let expires_at = Utc::now() + request.duration.as_duration();

        let claim = self.claims.claim(request.target, ModerationAction::Mute);
        self.gateway
            .timeout(request.target, Some(expires_at), reason.clone())
            .await?;
        claim.complete();

        let notice = ModerationNotice {
            action: ModerationAction::Mute,
            target: request.target,
            game_account: self.linked_account(request.target).await,
            actor: Some(request.actor),
            reason,
            audit_id: None,
            previous_expiry: None,
            expires_at: Some(expires_at),
            occurred_at: Utc::now(),
        };
        info!(member = request.target, %expires_at, "member muted");
        self.publish(notice.clone()).await;
        Ok(notice)
    }

    pub async fn unmute(&self, request: UnmuteRequest) -> Result<ModerationNotice> {
        let reason = non_blank(request.reason.as_deref()).map(str::to_string);

        let claim = self.claims.claim(request.target, ModerationAction::Unmute);
        self.gateway
            .timeout(request.target, None, reason.clone())
            .await?;
        claim.complete();

        let notice = ModerationNotice {
            action: ModerationAction::Unmute,
            target: request.target,
            game_account: self.linked_account(request.target).await,
            actor: Some(request.actor),
            reason,
            audit_id: None,
            previous_expiry: None,
            expires_at: None,
            occurred_at: Utc::now(),
        };
        info!(member = request.target, "member unmuted");
        self.publish(notice.clone()).await;
        Ok(notice)
    }

    /// Reconciles one audit notification against the ledger.
    pub async fn on_audit_entry(&self, entry: AuditEntry) -> Result<Transition> {
        match entry.action {
            AuditAction::Ban => self.observe_ban(entry).await,
            AuditAction::Unban => self.observe_unban(entry).await,
            AuditAction::MemberUpdate => self.observe_timeout(entry).await,
            AuditAction::MemberRemoval => match entry.target_id {
                Some(target) => self.on_member_removed(target).await,
                None => Ok(Transition::Ignored),
            },
            AuditAction::Other => Ok(Transition::Ignored),
        }
    }

    /// A member left. Treated as a ban only when the audit trail shows a recent ban
    /// of that member; otherwise it was a kick or a voluntary leave.
    pub async fn on_member_removed(&self, target: PlatformId) -> Result<Transition> {
        let cutoff = self.cutoff();
        let entries = self
            .audit
            .recent(AuditAction::Ban, self.settings.audit_page)
            .await?;
        match entries
            .into_iter()
            .find(|entry| entry.target_id == Some(target) && entry.created_at >= cutoff)
        {
            Some(entry) => self.observe_ban(entry).await,
            None => {
                debug!(member = target, "member removal without a recent ban");
                Ok(Transition::Ignored)
            }
        }
    }

    /// The currently open ban for `target`, if any.
    pub async fn open_record(&self, target: PlatformId) -> Result<Option<PunishmentRecord>> {
        let filter = Filter::eq("target_platform_id", target).and(Filter::is_null("closure"));
        let newest = Sort::descending("audit_id");
        Ok(self
            .punishments
            .find_many(&filter, Some(&newest), Some(1))
            .await?
            .into_iter()
            .next())
    }

    async fn observe_ban(&self, entry: AuditEntry) -> Result<Transition> {
        let Some(target) = entry.target_id else {
            return Ok(Transition::Ignored);
        };
        if let Some(reason) = self.suppression(&entry, target, ModerationAction::Ban) {
            debug!(member = target, audit_id = entry.id, ?reason, "ban notification suppressed");
            return Ok(Transition::Suppressed(reason));
        }

        let _guard = self.locks.lock(target).await;
        if self
            .punishments
            .find_one(&Filter::eq("audit_id", entry.id))
            .await?
            .is_some()
        {
            info!(member = target, audit_id = entry.id, "ban already on record");
            return Ok(Transition::Duplicate(entry.id));
        }
        if let Some(open) = self.open_record(target).await? {
            warn!(
                member = target,
                audit_id = entry.id,
                open = open.audit_id,
                "ban notification while another ban is open"
            );
            return Ok(Transition::Duplicate(open.audit_id));
        }

        let account = self.linked_account(target).await;
        let record = PunishmentRecord {
            audit_id: entry.id,
            kind: PunishmentKind::Ban,
            target_platform_id: target,
            game_account_id: account.as_ref().map(|a| a.id.clone()),
            opened_at: entry.created_at,
            opened_by: self.human(entry.actor_id),
            reason: non_blank(entry.reason.as_deref()).map(str::to_string),
            closure: None,
        };
        match self.punishments.insert_new(&record).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => return Ok(Transition::Duplicate(entry.id)),
            Err(e) => return Err(e.into()),
        }

        info!(member = target, audit_id = entry.id, "ban recorded from audit trail");
        self.announce_open(&record, account).await;
        Ok(Transition::Opened(record))
    }

    async fn observe_unban(&self, entry: AuditEntry) -> Result<Transition> {
        let Some(target) = entry.target_id else {
            return Ok(Transition::Ignored);
        };
        if let Some(reason) = self.suppression(&entry, target, ModerationAction::Unban) {
            debug!(member = target, audit_id = entry.id, ?reason, "unban notification suppressed");
            return Ok(Transition::Suppressed(reason));
        }

        let _guard = self.locks.lock(target).await;
        if self
            .punishments
            .find_one(&Filter::eq("closure.closed_audit_id", entry.id))
            .await?
            .is_some()
        {
            info!(member = target, audit_id = entry.id, "unban already on record");
            return Ok(Transition::Duplicate(entry.id));
        }
        let Some(open) = self.open_record(target).await? else {
            error!(member = target, audit_id = entry.id, "unban observed with no open ban on record");
            return Err(IntegrityViolation::NoOpenPunishment { target }.into());
        };

        let closed = close(
            open,
            entry.id,
            self.human(entry.actor_id),
            non_blank(entry.reason.as_deref()).map(str::to_string),
        );
        self.punishments.upsert(&closed).await?;

        info!(member = target, audit_id = entry.id, "ban closed from audit trail");
        self.announce_close(&closed).await;
        Ok(Transition::Closed(closed))
    }

    async fn observe_timeout(&self, entry: AuditEntry) -> Result<Transition> {
        let (Some(target), Some(change)) = (entry.target_id, entry.timeout) else {
            return Ok(Transition::Ignored);
        };
        if change.before == change.after {
            return Ok(Transition::Ignored);
        }
        let action = if change.is_mute(entry.created_at) {
            ModerationAction::Mute
        } else {
            ModerationAction::Unmute
        };
        if let Some(reason) = self.suppression(&entry, target, action) {
            debug!(member = target, audit_id = entry.id, ?reason, "timeout notification suppressed");
            return Ok(Transition::Suppressed(reason));
        }
        if !self.seen.first_sight(entry.id) {
            return Ok(Transition::Suppressed(Suppression::SeenBefore));
        }

        let notice = ModerationNotice {
            action,
            target,
            game_account: self.linked_account(target).await,
            actor: self.human(entry.actor_id),
            reason: non_blank(entry.reason.as_deref()).map(str::to_string),
            audit_id: Some(entry.id),
            previous_expiry: change.before,
            expires_at: change.after,
            occurred_at: entry.created_at,
        };
        self.publish(notice.clone()).await;
        Ok(Transition::Logged(notice))
    }

    fn suppression(
        &self,
        entry: &AuditEntry,
        target: PlatformId,
        action: ModerationAction,
    ) -> Option<Suppression> {
        if self.claims.offer(target, action, entry.id) {
            return Some(Suppression::Claimed);
        }
        if self.settings.suppress_bot_actor && entry.actor_id == Some(self.settings.bot_id) {
            return Some(Suppression::BotActor);
        }
        None
    }

    /// Polls the audit trail for the entry a just-executed command produced.
    async fn correlate(
        &self,
        action: AuditAction,
        target: PlatformId,
        claim: Option<&Claim<'_>>,
    ) -> Result<AuditId> {
        for attempt in 0..self.settings.correlation_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.correlation_delay).await;
            }
            if let Some(id) = claim.and_then(|c| c.delivered()) {
                return Ok(id);
            }
            let entries = match self.audit.recent(action, self.settings.audit_page).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(member = target, attempt, error = %e, "audit trail poll failed");
                    continue;
                }
            };
            let cutoff = self.cutoff();
            for entry in entries {
                if entry.target_id != Some(target) || entry.created_at < cutoff {
                    continue;
                }
                if !self.is_recorded(action, entry.id).await? {
                    debug!(member = target, audit_id = entry.id, attempt, "audit entry correlated");
                    return Ok(entry.id);
                }
            }
        }

        let action = match action {
            AuditAction::Unban => "unban",
            _ => "ban",
        };
        error!(member = target, action, "no audit entry to correlate with");
        Err(IntegrityViolation::UncorrelatedAudit { target, action }.into())
    }

    async fn is_recorded(&self, action: AuditAction, audit_id: AuditId) -> Result<bool> {
        let filter = match action {
            AuditAction::Unban => Filter::eq("closure.closed_audit_id", audit_id),
            _ => Filter::eq("audit_id", audit_id),
        };
        Ok(self.punishments.find_one(&filter).await?.is_some())
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let lookback = chrono::Duration::from_std(self.settings.lookback)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Utc::now() - lookback
    }

    /// Actor attribution, with the bot itself counted as unknown.
    fn human(&self, actor: Option<PlatformId>) -> Option<PlatformId> {
        actor.filter(|id| *id != self.settings.bot_id)
    }

    async fn linked_account(&self, target: PlatformId) -> Option<GameAccount> {
        match self.links.find_one(&Filter::eq("platform_id", target)).await {
            Ok(link) => link.map(|link| link.account()),
            Err(e) => {
                warn!(member = target, error = %e, "link lookup failed");
                None
            }
        }
    }

    async fn announce_open(&self, record: &PunishmentRecord, account: Option<GameAccount>) {
        if record.reason.is_none() {
            let notifier = self.notifier.clone();
            let pending = record.clone();
            tokio::spawn(async move {
                let audit_id = pending.audit_id;
                if let Err(e) = notifier.missing_reason(pending).await {
                    warn!(audit_id, error = %e, "missing reason request failed");
                }
            });
        }
        self.publish(ModerationNotice {
            action: ModerationAction::Ban,
            target: record.target_platform_id,
            game_account: account,
            actor: record.opened_by,
            reason: record.reason.clone(),
            audit_id: Some(record.audit_id),
            previous_expiry: None,
            expires_at: None,
            occurred_at: record.opened_at,
        })
        .await;
    }

    async fn announce_close(&self, record: &PunishmentRecord) {
        let Some(closure) = &record.closure else {
            return;
        };
        self.publish(ModerationNotice {
            action: ModerationAction::Unban,
            target: record.target_platform_id,
            game_account: self.linked_account(record.target_platform_id).await,
            actor: closure.closed_by,
            reason: closure.close_reason.clone(),
            audit_id: Some(closure.closed_audit_id),
            previous_expiry: None,
            expires_at: None,
            occurred_at: closure.closed_at,
        })
        .await;
    }

    async fn publish(&self, notice: ModerationNotice) {
        let (action, target) = (notice.action, notice.target);
        if let Err(e) = self.notifier.moderation_notice(notice).await {
            warn!(%action, member = target, error = %e, "moderation notice not delivered");
        }
    }
}

fn close(
    mut record: PunishmentRecord,
    audit_id: AuditId,
    closed_by: Option<PlatformId>,
    reason: Option<String>,
) -> PunishmentRecord {
    record.closure = Some(Closure {
        closed_audit_id: audit_id,
        closed_by,
        close_reason: reason,
        closed_at: Utc::now(),
    });
    record
}

//! # LinkingEngine
//!
//! Resolve → verify ownership → uniqueness check → persist → role/nickname sync.
//!
//! The link relation is a partial bijection: a member has at most one account and an
//! account at most one member. The uniqueness check and the insert run under keyed
//! locks on both the member and the account, so two verifications racing for either
//! side serialize.

use gk_core::error::{AppError, LinkSide, Result, StoreError};
use gk_core::filter::Filter;
use gk_core::models::{
    AccountRef, Caller, GameAccount, GameAccountId, IdentityLink, Member, PlatformId, Rank,
    ReputationProfile,
};
use gk_core::traits::{IdentityResolver, LinkStore, MemberDirectory, ReputationGate};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::locks::KeyedLocks;
use crate::roles::RoleLayout;

/// Autocomplete lists are capped by the platform.
const MAX_SUGGESTIONS: usize = 25;

#[derive(Debug, Clone)]
pub struct LinkingSettings {
    /// Bound on user-facing lookups.
    pub interactive_timeout: Duration,
    /// Offered when autocomplete input is empty.
    pub default_suggestions: Vec<String>,
}

impl Default for LinkingSettings {
    fn default() -> Self {
        Self {
            interactive_timeout: Duration::from_secs(5),
            default_suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum LinkKey {
    Platform(PlatformId),
    Account(GameAccountId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Created(IdentityLink),
    /// The same pair was already linked; nothing was written.
    Unchanged(IdentityLink),
}

impl LinkOutcome {
    pub fn link(&self) -> &IdentityLink {
        match self {
            Self::Created(link) | Self::Unchanged(link) => link,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced {
        account: GameAccount,
        rank: Rank,
        changes: usize,
    },
    Desynced {
        changes: usize,
    },
    SkippedBot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub label: String,
    pub value: String,
}

enum Nickname {
    Keep,
    Set(String),
    Reset,
}

pub struct LinkingEngine {
    resolver: Arc<dyn IdentityResolver>,
    reputation: Arc<dyn ReputationGate>,
    links: Arc<LinkStore>,
    directory: Arc<dyn MemberDirectory>,
    roles: RoleLayout,
    settings: LinkingSettings,
    locks: KeyedLocks<LinkKey>,
}

impl LinkingEngine {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        reputation: Arc<dyn ReputationGate>,
        links: Arc<LinkStore>,
        directory: Arc<dyn MemberDirectory>,
        roles: RoleLayout,
        settings: LinkingSettings,
    ) -> Self {
        Self {
            resolver,
            reputation,
            links,
            directory,
            roles,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    /// Links the caller to the account they name, provided the account's reputation
    /// record publishes the caller's handle.
    pub async fn self_verify(&self, caller: &Caller, account_ref: &str) -> Result<LinkOutcome> {
        let account = self.resolve(account_ref).await?;
        let profile = self.reputation.profile(&account.id).await?;
        ensure_ownership(caller, &profile, &account)?;

        let outcome = self
            .establish(IdentityLink::self_service(caller.id, &account))
            .await?;
        info!(
            platform_id = caller.id,
            account = %account.id,
            created = matches!(outcome, LinkOutcome::Created(_)),
            "member verified"
        );
        self.apply_link_effects(caller.id, &account, profile.rank).await;
        Ok(outcome)
    }

    /// Self-verification performed by staff on behalf of `target`; the ownership check
    /// still runs against the target's handle.
    pub async fn staff_verify(
        &self,
        staff: PlatformId,
        target: &Caller,
        account_ref: &str,
    ) -> Result<LinkOutcome> {
        debug!(staff, member = target.id, "staff verification");
        self.self_verify(target, account_ref).await
    }

    /// Links without the ownership check. Requires a reason, which is stored on the link.
    pub async fn force_verify(
        &self,
        staff: PlatformId,
        target: PlatformId,
        account_ref: &str,
        reason: &str,
    ) -> Result<LinkOutcome> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation(
                "a reason is required to override verification".to_string(),
            ));
        }
        let account = self.resolve(account_ref).await?;
        let profile = self.reputation.profile(&account.id).await?;

        let outcome = self
            .establish(IdentityLink::manual_override(target, &account, staff, reason))
            .await?;
        info!(
            platform_id = target,
            account = %account.id,
            staff,
            reason,
            "verification overridden"
        );
        self.apply_link_effects(target, &account, profile.rank).await;
        Ok(outcome)
    }

    /// Removes the member's link and reverts the roles and nickname it granted.
    pub async fn unlink(&self, platform_id: PlatformId) -> Result<IdentityLink> {
        let removed = {
            let _guard = self.locks.lock(LinkKey::Platform(platform_id)).await;
            self.links
                .delete_one(&Filter::eq("platform_id", platform_id))
                .await?
                .ok_or(AppError::NotLinked { platform_id })?
        };
        info!(platform_id, account = %removed.game_account_id, "member unlinked");

        match self.directory.member(platform_id).await {
            Ok(Some(member)) => {
                self.apply(&member, None, Nickname::Reset).await;
            }
            Ok(None) => debug!(platform_id, "unlinked member is no longer in the guild"),
            Err(e) => side_effect_failed("fetch member", platform_id, &e),
        }
        Ok(removed)
    }

    /// Brings a member's roles and nickname in line with their link. Idempotent, and
    /// the unit of work of the periodic sweep.
    pub async fn sync_member(
        &self,
        platform_id: PlatformId,
        known: Option<GameAccount>,
    ) -> Result<SyncOutcome> {
        let member = self
            .directory
            .member(platform_id)
            .await?
            .ok_or(AppError::MemberNotFound { platform_id })?;
        if member.is_bot {
            return Ok(SyncOutcome::SkippedBot);
        }

        let account = match known {
            Some(account) => Some(account),
            None => match self.link_for(platform_id).await? {
                Some(link) => Some(self.refresh_display_name(link).await?),
                None => None,
            },
        };

        let Some(account) = account else {
            let changes = self.apply(&member, None, Nickname::Keep).await;
            return Ok(SyncOutcome::Desynced { changes });
        };

        let profile = self.reputation.profile(&account.id).await?;
        let changes = self
            .apply(
                &member,
                Some(profile.rank),
                Nickname::Set(account.display_name.clone()),
            )
            .await;
        Ok(SyncOutcome::Synced {
            account,
            rank: profile.rank,
            changes,
        })
    }

    /// Account suggestions for partially typed input. Never waits longer than the
    /// interactive timeout; the input itself is always offered last.
    pub async fn suggest_accounts(&self, input: &str) -> Vec<Suggestion> {
        let input = input.trim();
        if input.is_empty() {
            return self
                .settings
                .default_suggestions
                .iter()
                .take(MAX_SUGGESTIONS)
                .map(|name| Suggestion {
                    label: name.clone(),
                    value: name.clone(),
                })
                .collect();
        }

        let stem = input.to_lowercase();
        let search = self.resolver.search_prefix(&stem);
        let found = match tokio::time::timeout(self.settings.interactive_timeout, search).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(error = %e, input, "account search failed");
                Vec::new()
            }
            Err(_) => {
                debug!(input, "account search timed out");
                Vec::new()
            }
        };

        found
            .into_iter()
            .map(|account| Suggestion {
                label: account.display_name,
                value: account.id.to_string(),
            })
            .chain(std::iter::once(Suggestion {
                label: input.to_string(),
                value: input.to_string(),
            }))
            .take(MAX_SUGGESTIONS)
            .collect()
    }

    pub async fn link_for(&self, platform_id: PlatformId) -> Result<Option<IdentityLink>> {
        Ok(self
            .links
            .find_one(&Filter::eq("platform_id", platform_id))
            .await?)
    }

    async fn resolve(&self, account_ref: &str) -> Result<GameAccount> {
        let reference = AccountRef::parse(account_ref).ok_or_else(|| AppError::AccountNotFound {
            reference: account_ref.trim().to_string(),
        })?;
        let lookup = self.resolver.lookup(&reference);
        match tokio::time::timeout(self.settings.interactive_timeout, lookup).await {
            Err(_) => Err(AppError::external(
                "account lookup",
                format!("no answer within {:?}", self.settings.interactive_timeout),
            )),
            Ok(Ok(Some(account))) => Ok(account),
            Ok(Ok(None)) => Err(AppError::AccountNotFound {
                reference: reference.to_string(),
            }),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn establish(&self, link: IdentityLink) -> Result<LinkOutcome> {
        let _guards = self
            .locks
            .lock_all(vec![
                LinkKey::Platform(link.platform_id),
                LinkKey::Account(link.game_account_id.clone()),
            ])
            .await;

        let filter = uniqueness_filter(&link);
        let existing = self.links.find_many(&filter, None, Some(2)).await?;
        if let Some(same) = check_uniqueness(&link, &existing)? {
            debug!(platform_id = link.platform_id, "pair already linked");
            return Ok(LinkOutcome::Unchanged(same));
        }

        match self.links.insert_new(&link).await {
            Ok(()) => Ok(LinkOutcome::Created(link)),
            // Another writer outside this process won the race; report what it wrote.
            Err(StoreError::DuplicateKey { .. }) => {
                let existing = self.links.find_many(&filter, None, Some(2)).await?;
                match check_uniqueness(&link, &existing)? {
                    Some(same) => Ok(LinkOutcome::Unchanged(same)),
                    None => Err(AppError::Internal(format!(
                        "link insert for {} collided without a visible conflict",
                        link.platform_id
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The current game name, persisted onto the link when it changed.
    async fn refresh_display_name(&self, link: IdentityLink) -> Result<GameAccount> {
        let reference = AccountRef::Id(link.game_account_id.clone());
        let current = match self.resolver.lookup(&reference).await {
            Ok(Some(account)) => account,
            Ok(None) => return Ok(link.account()),
            Err(e) => {
                debug!(error = %e, account = %link.game_account_id, "name refresh skipped");
                return Ok(link.account());
            }
        };
        if current.display_name != link.display_name {
            let _guard = self.locks.lock(LinkKey::Platform(link.platform_id)).await;
            if let Some(mut stored) = self.link_for(link.platform_id).await? {
                if stored.game_account_id == current.id {
                    stored.display_name = current.display_name.clone();
                    self.links.upsert(&stored).await?;
                }
            }
        }
        Ok(current)
    }

    async fn apply_link_effects(&self, platform_id: PlatformId, account: &GameAccount, rank: Rank) {
        match self.directory.member(platform_id).await {
            Ok(Some(member)) => {
                self.apply(&member, Some(rank), Nickname::Set(account.display_name.clone()))
                    .await;
            }
            Ok(None) => debug!(platform_id, "linked member is not in the guild"),
            Err(e) => side_effect_failed("fetch member", platform_id, &e),
        }
    }

    /// Applies the role diff and nickname change. Failures are logged and skipped.
    async fn apply(&self, member: &Member, rank: Option<Rank>, nickname: Nickname) -> usize {
        let diff = self.roles.plan(&member.roles, rank);
        let mut changes = 0;

        for role in diff.add {
            match self.directory.add_role(member.id, role).await {
                Ok(()) => changes += 1,
                Err(e) => side_effect_failed("add role", member.id, &e),
            }
        }
        for role in diff.remove {
            match self.directory.remove_role(member.id, role).await {
                Ok(()) => changes += 1,
                Err(e) => side_effect_failed("remove role", member.id, &e),
            }
        }

        let wanted = match nickname {
            Nickname::Keep => None,
            Nickname::Set(name) if member.nickname.as_deref() != Some(name.as_str()) => {
                Some(Some(name))
            }
            Nickname::Set(_) => None,
            Nickname::Reset if member.nickname.is_some() => Some(None),
            Nickname::Reset => None,
        };
        if let Some(nick) = wanted {
            match self.directory.set_nickname(member.id, nick).await {
                Ok(()) => changes += 1,
                Err(e) => side_effect_failed("set nickname", member.id, &e),
            }
        }
        changes
    }
}

fn side_effect_failed(action: &str, platform_id: PlatformId, error: &AppError) {
    warn!(platform_id, action, kind = ?error.kind(), error = %error, "member sync step failed");
}

fn ensure_ownership(
    caller: &Caller,
    profile: &ReputationProfile,
    account: &GameAccount,
) -> Result<()> {
    let claimed = profile
        .handle
        .as_deref()
        .map(str::trim)
        .filter(|handle| !handle.is_empty());
    match claimed {
        Some(handle) if handle.to_lowercase() == caller.handle.trim().to_lowercase() => Ok(()),
        _ => Err(AppError::OwnershipMismatch {
            expected: caller.handle.clone(),
            claimed: claimed.map(str::to_string),
            account: account.clone(),
        }),
    }
}

fn uniqueness_filter(link: &IdentityLink) -> Filter {
    Filter::eq("platform_id", link.platform_id)
        .or(Filter::eq("game_account_id", link.game_account_id.as_str()))
}

/// `Some` when the exact pair already exists; an error when either side is taken.
fn check_uniqueness(attempt: &IdentityLink, existing: &[IdentityLink]) -> Result<Option<IdentityLink>> {
    if let Some(same) = existing.iter().find(|link| {
        link.platform_id == attempt.platform_id && link.game_account_id == attempt.game_account_id
    }) {
        return Ok(Some(same.clone()));
    }
    let taken = existing
        .iter()
        .find(|link| link.platform_id == attempt.platform_id)
        .map(|link| (LinkSide::Platform, link))
        .or_else(|| {
            existing
                .iter()
                .find(|link| link.game_account_id == attempt.game_account_id)
                .map(|link| (LinkSide::Account, link))
        });
    match taken {
        Some((side, link)) => Err(AppError::IdentityAlreadyLinked {
            side,
            existing: Box::new(link.clone()),
            attempted_platform: attempt.platform_id,
            attempted_account: attempt.account(),
        }),
        None => Ok(None),
    }
}

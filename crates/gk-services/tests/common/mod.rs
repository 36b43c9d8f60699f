#![allow(dead_code)]

use chrono::{DateTime, Utc};
use gk_core::models::{
    AccountRef, AuditAction, AuditEntry, GameAccount, GameAccountId, Member, PlatformId, Rank,
    ReputationProfile,
};
use gk_core::{MockIdentityResolver, MockMemberDirectory, MockNotifier, MockReputationGate};
use gk_services::RoleLayout;
use std::collections::HashMap;

pub const VERIFIED_ROLE: u64 = 100;
pub const MVP_ROLE: u64 = 200;
pub const BOT_ID: PlatformId = 1;

pub fn steve() -> GameAccount {
    account('a', "Steve")
}

pub fn alex() -> GameAccount {
    account('b', "Alex")
}

pub fn account(hex: char, name: &str) -> GameAccount {
    GameAccount {
        id: GameAccountId::parse(&hex.to_string().repeat(32)).unwrap(),
        display_name: name.to_string(),
    }
}

pub fn layout() -> RoleLayout {
    RoleLayout {
        verified: Some(VERIFIED_ROLE),
        ranks: HashMap::from([(Rank::Mvp, MVP_ROLE)]),
    }
}

pub fn member(id: PlatformId, handle: &str) -> Member {
    Member {
        id,
        handle: handle.to_string(),
        nickname: None,
        roles: Vec::new(),
        is_bot: false,
    }
}

/// Knows Steve and Alex by name and by id.
pub fn resolver() -> MockIdentityResolver {
    let mut resolver = MockIdentityResolver::new();
    resolver.expect_lookup().returning(|reference| {
        Ok([steve(), alex()].into_iter().find(|known| match reference {
            AccountRef::Id(id) => known.id == *id,
            AccountRef::Name(name) => known.display_name.eq_ignore_ascii_case(name),
        }))
    });
    resolver
        .expect_search_prefix()
        .returning(|stem| {
            Ok([steve(), alex()]
                .into_iter()
                .filter(|known| known.display_name.to_lowercase().starts_with(stem))
                .collect())
        });
    resolver
}

/// Steve publishes the handle `steve` and holds MVP; Alex publishes `alex`.
pub fn reputation() -> MockReputationGate {
    let mut reputation = MockReputationGate::new();
    reputation.expect_profile().returning(|id| {
        let (handle, rank) = if *id == steve().id {
            ("steve", Rank::Mvp)
        } else {
            ("alex", Rank::Default)
        };
        Ok(ReputationProfile {
            account_id: id.clone(),
            handle: Some(handle.to_string()),
            rank,
        })
    });
    reputation
}

/// Every id is a human member whose handle is `user<id>`; all edits succeed.
pub fn directory() -> MockMemberDirectory {
    let mut directory = MockMemberDirectory::new();
    directory
        .expect_member()
        .returning(|id| Ok(Some(member(id, &format!("user{id}")))));
    directory.expect_add_role().returning(|_, _| Ok(()));
    directory.expect_remove_role().returning(|_, _| Ok(()));
    directory.expect_set_nickname().returning(|_, _| Ok(()));
    directory
}

pub fn quiet_notifier() -> MockNotifier {
    let mut notifier = MockNotifier::new();
    notifier.expect_moderation_notice().returning(|_| Ok(()));
    notifier.expect_missing_reason().returning(|_| Ok(()));
    notifier.expect_operator_alert().returning(|_| Ok(()));
    notifier
}

pub fn audit_entry(
    id: u64,
    action: AuditAction,
    actor: Option<PlatformId>,
    target: PlatformId,
    created_at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry {
        id,
        action,
        actor_id: actor,
        target_id: Some(target),
        reason: None,
        created_at,
        timeout: None,
    }
}

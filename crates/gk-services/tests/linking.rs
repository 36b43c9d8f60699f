mod common;

use async_trait::async_trait;
use common::*;
use gk_core::error::{AppError, LinkSide, Result};
use gk_core::filter::Filter;
use gk_core::models::{AccountRef, Caller, GameAccount, IdentityLink, LinkSource};
use gk_core::traits::{DocumentStore, IdentityResolver};
use gk_core::{MockIdentityResolver, MockMemberDirectory, MockReputationGate};
use gk_services::{LinkOutcome, LinkingEngine, LinkingSettings, SyncOutcome};
use gk_store_memory::MemoryStore;
use mockall::predicate::eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

struct Fixture {
    links: Arc<MemoryStore<IdentityLink>>,
    engine: Arc<LinkingEngine>,
}

fn fixture_with(
    resolver: impl IdentityResolver + 'static,
    reputation: MockReputationGate,
    directory: MockMemberDirectory,
    settings: LinkingSettings,
) -> Fixture {
    let links = Arc::new(MemoryStore::new());
    let engine = LinkingEngine::new(
        Arc::new(resolver),
        Arc::new(reputation),
        links.clone(),
        Arc::new(directory),
        layout(),
        settings,
    );
    Fixture {
        links,
        engine: Arc::new(engine),
    }
}

fn fixture() -> Fixture {
    fixture_with(resolver(), reputation(), directory(), LinkingSettings::default())
}

fn caller(id: u64, handle: &str) -> Caller {
    Caller {
        id,
        handle: handle.to_string(),
    }
}

async fn stored(links: &MemoryStore<IdentityLink>, platform_id: u64) -> Option<IdentityLink> {
    links
        .find_one(&Filter::eq("platform_id", platform_id))
        .await
        .unwrap()
}

#[tokio::test]
async fn self_verify_links_caller_to_account() {
    let fx = fixture();
    let outcome = assert_ok!(fx.engine.self_verify(&caller(10, "Steve"), "steve").await);

    assert!(matches!(outcome, LinkOutcome::Created(_)));
    let link = stored(&fx.links, 10).await.unwrap();
    assert_eq!(link.game_account_id, steve().id);
    assert_eq!(link.source, LinkSource::SelfService);
    assert_eq!(fx.links.len(), 1);
}

#[tokio::test]
async fn verification_grants_verified_and_rank_roles_and_nickname() {
    let mut directory = MockMemberDirectory::new();
    directory
        .expect_member()
        .returning(|id| Ok(Some(member(id, "steve"))));
    directory
        .expect_add_role()
        .with(eq(10), eq(VERIFIED_ROLE))
        .times(1)
        .returning(|_, _| Ok(()));
    directory
        .expect_add_role()
        .with(eq(10), eq(MVP_ROLE))
        .times(1)
        .returning(|_, _| Ok(()));
    directory
        .expect_set_nickname()
        .withf(|id, nick| *id == 10 && nick.as_deref() == Some("Steve"))
        .times(1)
        .returning(|_, _| Ok(()));

    let fx = fixture_with(resolver(), reputation(), directory, LinkingSettings::default());
    assert_ok!(fx.engine.self_verify(&caller(10, "steve"), "Steve").await);
}

#[tokio::test]
async fn reverifying_the_same_pair_changes_nothing() {
    let fx = fixture();
    let first = fx.engine.self_verify(&caller(10, "steve"), "steve").await.unwrap();
    let second = fx.engine.self_verify(&caller(10, "steve"), "steve").await.unwrap();

    assert!(matches!(second, LinkOutcome::Unchanged(_)));
    assert_eq!(second.link(), first.link());
    assert_eq!(stored(&fx.links, 10).await.as_ref(), Some(first.link()));
}

#[tokio::test]
async fn account_linked_elsewhere_conflicts_and_keeps_the_first_link() {
    let fx = fixture();
    let first = fx.engine.self_verify(&caller(10, "steve"), "steve").await.unwrap();

    let err = fx
        .engine
        .self_verify(&caller(20, "steve"), "steve")
        .await
        .unwrap_err();
    match err {
        AppError::IdentityAlreadyLinked {
            side,
            existing,
            attempted_platform,
            ..
        } => {
            assert_eq!(side, LinkSide::Account);
            assert_eq!(existing.platform_id, 10);
            assert_eq!(attempted_platform, 20);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(stored(&fx.links, 10).await.as_ref(), Some(first.link()));
    assert!(stored(&fx.links, 20).await.is_none());
}

#[tokio::test]
async fn member_linked_to_another_account_conflicts_on_the_platform_side() {
    let fx = fixture();
    fx.engine
        .force_verify(1, 10, "alex", "appeal")
        .await
        .unwrap();

    let err = fx
        .engine
        .self_verify(&caller(10, "steve"), "steve")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::IdentityAlreadyLinked { side: LinkSide::Platform, .. }
    ));
}

#[tokio::test]
async fn foreign_handle_is_an_ownership_mismatch() {
    let fx = fixture();
    let err = fx
        .engine
        .self_verify(&caller(10, "steve"), "alex")
        .await
        .unwrap_err();
    match err {
        AppError::OwnershipMismatch {
            expected,
            claimed,
            account,
        } => {
            assert_eq!(expected, "steve");
            assert_eq!(claimed.as_deref(), Some("alex"));
            assert_eq!(account, alex());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fx.links.is_empty());
}

#[tokio::test]
async fn malformed_reference_is_not_found_without_a_lookup() {
    let mut resolver = MockIdentityResolver::new();
    resolver.expect_lookup().never();
    let fx = fixture_with(resolver, reputation(), directory(), LinkingSettings::default());

    let err = fx
        .engine
        .self_verify(&caller(10, "steve"), "bad name!")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccountNotFound { .. }));
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let fx = fixture();
    let err = fx
        .engine
        .self_verify(&caller(10, "steve"), "nobody_here")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccountNotFound { ref reference } if reference == "nobody_here"));
}

struct SlowResolver;

#[async_trait]
impl IdentityResolver for SlowResolver {
    async fn lookup(&self, _reference: &AccountRef) -> Result<Option<GameAccount>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Some(steve()))
    }

    async fn search_prefix(&self, _stem: &str) -> Result<Vec<GameAccount>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(vec![steve()])
    }
}

fn impatient() -> LinkingSettings {
    LinkingSettings {
        interactive_timeout: Duration::from_millis(20),
        default_suggestions: vec!["Technoblade".to_string()],
    }
}

#[tokio::test]
async fn slow_lookup_fails_verification_as_external() {
    let fx = fixture_with(SlowResolver, reputation(), directory(), impatient());
    let err = fx
        .engine
        .self_verify(&caller(10, "steve"), "steve")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ExternalService { .. }));
    assert!(fx.links.is_empty());
}

#[tokio::test]
async fn slow_search_falls_back_to_echoing_the_input() {
    let fx = fixture_with(SlowResolver, reputation(), directory(), impatient());
    let suggestions = fx.engine.suggest_accounts("ste").await;
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].value, "ste");

    let defaults = fx.engine.suggest_accounts("  ").await;
    assert_eq!(defaults[0].label, "Technoblade");
}

#[tokio::test]
async fn suggestions_list_matches_before_the_echo() {
    let fx = fixture();
    let suggestions = fx.engine.suggest_accounts("St").await;
    let labels: Vec<_> = suggestions.iter().map(|s| s.label.as_str()).collect();
    assert_eq!(labels, vec!["Steve", "St"]);
    assert_eq!(suggestions[0].value, steve().id.to_string());
}

#[tokio::test]
async fn suggestions_are_capped() {
    let mut resolver = MockIdentityResolver::new();
    resolver.expect_search_prefix().returning(|_| {
        Ok((0..40)
            .map(|i| account('c', &format!("player{i}")))
            .collect())
    });
    let fx = fixture_with(resolver, reputation(), directory(), LinkingSettings::default());
    assert_eq!(fx.engine.suggest_accounts("player").await.len(), 25);
}

#[tokio::test]
async fn force_verify_requires_a_reason() {
    let fx = fixture();
    let err = fx.engine.force_verify(1, 10, "alex", "   ").await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
    assert!(fx.links.is_empty());
}

#[tokio::test]
async fn force_verify_skips_the_handle_check_and_records_the_override() {
    let fx = fixture();
    // Alex publishes `alex`, not the target's handle.
    let outcome = fx
        .engine
        .force_verify(1, 10, "alex", " lost access to socials ")
        .await
        .unwrap();

    assert_eq!(
        outcome.link().source,
        LinkSource::ManualOverride {
            override_reason: "lost access to socials".to_string(),
            overridden_by: 1,
        }
    );
    assert_eq!(stored(&fx.links, 10).await.unwrap().game_account_id, alex().id);
}

#[tokio::test]
async fn staff_verify_checks_the_targets_handle() {
    let fx = fixture();
    let err = fx
        .engine
        .staff_verify(1, &caller(10, "someone_else"), "steve")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::OwnershipMismatch { .. }));

    assert_ok!(fx.engine.staff_verify(1, &caller(10, "steve"), "steve").await);
    assert!(stored(&fx.links, 10).await.is_some());
}

#[tokio::test]
async fn unlink_removes_the_link_and_resets_the_nickname() {
    let mut directory = MockMemberDirectory::new();
    directory.expect_member().returning(|id| {
        let mut m = member(id, "steve");
        m.roles = vec![VERIFIED_ROLE, MVP_ROLE, 999];
        m.nickname = Some("Steve".to_string());
        Ok(Some(m))
    });
    directory.expect_add_role().returning(|_, _| Ok(()));
    directory
        .expect_remove_role()
        .withf(|_, role| *role == VERIFIED_ROLE || *role == MVP_ROLE)
        .times(2)
        .returning(|_, _| Ok(()));
    directory
        .expect_set_nickname()
        .withf(|_, nick| nick.is_none())
        .times(1)
        .returning(|_, _| Ok(()));

    let fx = fixture_with(resolver(), reputation(), directory, LinkingSettings::default());
    fx.links
        .insert_new(&IdentityLink::self_service(10, &steve()))
        .await
        .unwrap();

    let removed = fx.engine.unlink(10).await.unwrap();
    assert_eq!(removed.game_account_id, steve().id);
    assert!(fx.links.is_empty());

    let err = fx.engine.unlink(10).await.unwrap_err();
    assert!(matches!(err, AppError::NotLinked { platform_id: 10 }));
}

#[tokio::test]
async fn side_effect_failures_do_not_fail_verification() {
    let mut directory = MockMemberDirectory::new();
    directory
        .expect_member()
        .returning(|id| Ok(Some(member(id, "steve"))));
    directory.expect_add_role().returning(|_, _| {
        Err(AppError::Permission {
            action: "add role".into(),
            message: "role is above the bot".into(),
        })
    });
    directory.expect_set_nickname().returning(|_, _| {
        Err(AppError::Permission {
            action: "set nickname".into(),
            message: "cannot edit the guild owner".into(),
        })
    });

    let fx = fixture_with(resolver(), reputation(), directory, LinkingSettings::default());
    assert_ok!(fx.engine.self_verify(&caller(10, "steve"), "steve").await);
    assert_eq!(fx.links.len(), 1);
}

#[tokio::test]
async fn sync_of_unlinked_member_strips_roles_but_keeps_nickname() {
    let mut directory = MockMemberDirectory::new();
    directory.expect_member().returning(|id| {
        let mut m = member(id, "steve");
        m.roles = vec![VERIFIED_ROLE];
        m.nickname = Some("custom".to_string());
        Ok(Some(m))
    });
    directory
        .expect_remove_role()
        .with(eq(10), eq(VERIFIED_ROLE))
        .times(1)
        .returning(|_, _| Ok(()));
    directory.expect_set_nickname().never();

    let fx = fixture_with(resolver(), reputation(), directory, LinkingSettings::default());
    let outcome = fx.engine.sync_member(10, None).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Desynced { changes: 1 });
}

#[tokio::test]
async fn sync_refreshes_a_renamed_account() {
    let fx = fixture();
    let mut old = IdentityLink::self_service(10, &steve());
    old.display_name = "OldSteve".to_string();
    fx.links.insert_new(&old).await.unwrap();

    let outcome = fx.engine.sync_member(10, None).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Synced { ref account, .. } if account.display_name == "Steve"));
    assert_eq!(stored(&fx.links, 10).await.unwrap().display_name, "Steve");
}

#[tokio::test]
async fn sync_skips_bots_and_reports_missing_members() {
    let mut directory = MockMemberDirectory::new();
    directory.expect_member().returning(|id| {
        Ok((id == 5).then(|| {
            let mut bot = member(5, "helper");
            bot.is_bot = true;
            bot
        }))
    });
    let fx = fixture_with(resolver(), reputation(), directory, LinkingSettings::default());

    assert_eq!(fx.engine.sync_member(5, None).await.unwrap(), SyncOutcome::SkippedBot);
    assert!(matches!(
        fx.engine.sync_member(6, None).await,
        Err(AppError::MemberNotFound { platform_id: 6 })
    ));
}

#[tokio::test]
async fn racing_verifications_of_one_account_leave_one_link() {
    let fx = fixture();
    let tasks: Vec<_> = (10..18)
        .map(|id| {
            let engine = fx.engine.clone();
            tokio::spawn(async move { engine.self_verify(&caller(id, "steve"), "steve").await })
        })
        .collect();

    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(LinkOutcome::Created(_)) => created += 1,
            Err(AppError::IdentityAlreadyLinked { .. }) => conflicts += 1,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!((created, conflicts), (1, 7));
    assert_eq!(fx.links.len(), 1);
}

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use gk_api::{router, Access, AppState};
use gk_core::models::{
    AccountRef, GameAccount, GameAccountId, IdentityLink, Member, PunishmentRecord, Rank,
    ReputationProfile,
};
use gk_core::{
    MockAuditTrail, MockIdentityResolver, MockMemberDirectory, MockModerationGateway,
    MockNotifier, MockReputationGate,
};
use gk_services::{LinkingEngine, LinkingSettings, ModerationSettings, ReconciliationEngine, RoleLayout};
use gk_store_memory::MemoryStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

const STAFF_ROLE: u64 = 7;

fn steve() -> GameAccount {
    GameAccount {
        id: GameAccountId::parse(&"a".repeat(32)).unwrap(),
        display_name: "Steve".into(),
    }
}

fn resolver() -> MockIdentityResolver {
    let mut resolver = MockIdentityResolver::new();
    resolver.expect_lookup().returning(|reference| {
        Ok(match reference {
            AccountRef::Name(name) if name.eq_ignore_ascii_case("steve") => Some(steve()),
            _ => None,
        })
    });
    resolver.expect_search_prefix().returning(|_| Ok(vec![steve()]));
    resolver
}

fn reputation() -> MockReputationGate {
    let mut reputation = MockReputationGate::new();
    reputation.expect_profile().returning(|id| {
        Ok(ReputationProfile {
            account_id: id.clone(),
            handle: Some("steve".into()),
            rank: Rank::Mvp,
        })
    });
    reputation
}

fn directory() -> MockMemberDirectory {
    let mut directory = MockMemberDirectory::new();
    directory.expect_member().returning(|id| {
        Ok(Some(Member {
            id,
            handle: if id == 10 { "steve".into() } else { format!("user{id}") },
            nickname: None,
            roles: Vec::new(),
            is_bot: false,
        }))
    });
    directory.expect_add_role().returning(|_, _| Ok(()));
    directory.expect_remove_role().returning(|_, _| Ok(()));
    directory.expect_set_nickname().returning(|_, _| Ok(()));
    directory
}

fn quiet_notifier() -> MockNotifier {
    let mut notifier = MockNotifier::new();
    notifier.expect_moderation_notice().returning(|_| Ok(()));
    notifier.expect_missing_reason().returning(|_| Ok(()));
    notifier.expect_operator_alert().returning(|_| Ok(()));
    notifier.expect_command_log().returning(|_| Ok(()));
    notifier
}

struct Harness {
    app: Router,
    links: Arc<MemoryStore<IdentityLink>>,
    punishments: Arc<MemoryStore<PunishmentRecord>>,
}

fn harness(gateway: MockModerationGateway, notifier: MockNotifier) -> Harness {
    let links = Arc::new(MemoryStore::<IdentityLink>::new());
    let punishments = Arc::new(MemoryStore::<PunishmentRecord>::new());
    let directory = Arc::new(directory());
    let notifier = Arc::new(notifier);

    let linking = LinkingEngine::new(
        Arc::new(resolver()),
        Arc::new(reputation()),
        links.clone(),
        directory.clone(),
        RoleLayout {
            verified: Some(100),
            ranks: HashMap::new(),
        },
        LinkingSettings::default(),
    );
    let moderation = ReconciliationEngine::new(
        Arc::new(gateway),
        Arc::new(MockAuditTrail::new()),
        punishments.clone(),
        links.clone(),
        notifier.clone(),
        ModerationSettings {
            bot_id: 1,
            ..ModerationSettings::default()
        },
    );

    let app = router(AppState {
        linking: Arc::new(linking),
        moderation: Arc::new(moderation),
        sweep: None,
        directory,
        notifier,
        access: Access {
            staff_role: Some(STAFF_ROLE),
            owners: Vec::new(),
        },
    });
    Harness {
        app,
        links,
        punishments,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn command(invoker: u64, roles: &[u64], command: Value) -> Value {
    json!({
        "invoker": { "id": invoker, "handle": if invoker == 10 { "steve" } else { "mod" }, "roles": roles },
        "command": command,
    })
}

#[tokio::test]
async fn verify_links_the_invoker() {
    let h = harness(MockModerationGateway::new(), quiet_notifier());

    let (status, reply) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(10, &[], json!({ "name": "verify", "account": "Steve" }))),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["title"], "Verified");
    assert_eq!(h.links.len(), 1);
}

#[tokio::test]
async fn completed_commands_reach_the_command_log() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut notifier = MockNotifier::new();
    notifier.expect_operator_alert().returning(|_| Ok(()));
    notifier.expect_command_log().returning(move |entry| {
        let _ = tx.send(entry);
        Ok(())
    });
    let h = harness(MockModerationGateway::new(), notifier);

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(10, &[], json!({ "name": "verify", "account": "Steve" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let entry = rx.recv().await.unwrap();
    assert_eq!(entry.invoker, 10);
    assert_eq!(entry.invoker_handle, "steve");
    assert_eq!(entry.command, "/verify account:Steve");
    assert_eq!(entry.reply_title, "Verified");

    // Rejected commands are not logged as completed.
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(20, &[], json!({ "name": "ban", "member": 42 }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unverify_without_a_link_is_not_found() {
    let h = harness(MockModerationGateway::new(), quiet_notifier());

    let (status, reply) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(10, &[], json!({ "name": "unverify" }))),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["title"], "Not Verified");
}

#[tokio::test]
async fn moderation_requires_staff() {
    let mut gateway = MockModerationGateway::new();
    gateway.expect_ban().never();
    let h = harness(gateway, quiet_notifier());

    let (status, reply) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(20, &[3], json!({ "name": "ban", "member": 42 }))),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(reply["title"], "Unauthorized");
    assert!(h.punishments.is_empty());
}

#[tokio::test]
async fn staff_ban_records_the_supplied_audit_entry() {
    let mut gateway = MockModerationGateway::new();
    gateway.expect_ban().times(1).returning(|_, _, _| Ok(()));
    let h = harness(gateway, quiet_notifier());

    let (status, reply) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(
            20,
            &[STAFF_ROLE],
            json!({ "name": "ban", "member": 42, "reason": "spam", "history": "one_hour", "audit_id": 900 }),
        )),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["title"], "Banned");
    assert_eq!(reply["fields"][0]["value"], "900");
    assert_eq!(h.punishments.len(), 1);
}

#[tokio::test]
async fn unban_without_a_record_alerts_the_operator() {
    let mut gateway = MockModerationGateway::new();
    gateway.expect_unban().never();
    let mut notifier = MockNotifier::new();
    notifier
        .expect_operator_alert()
        .times(1)
        .returning(|alert| {
            assert!(alert.detail.contains("NoOpenPunishment"));
            Ok(())
        });
    let h = harness(gateway, notifier);

    let (status, reply) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(20, &[STAFF_ROLE], json!({ "name": "unban", "member": 42 }))),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(reply["title"], "An Unknown Error Occurred");
}

#[tokio::test]
async fn audit_notifications_open_once() {
    let h = harness(MockModerationGateway::new(), quiet_notifier());
    let entry = json!({
        "id": 900,
        "action": "ban",
        "actor_id": 5,
        "target_id": 42,
        "reason": "raid",
        "created_at": Utc::now(),
    });

    let (status, first) = call(&h.app, Method::POST, "/events/audit", Some(entry.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, json!({ "outcome": "opened", "audit_id": 900 }));

    let (_, second) = call(&h.app, Method::POST, "/events/audit", Some(entry)).await;
    assert_eq!(second, json!({ "outcome": "duplicate", "audit_id": 900 }));
    assert_eq!(h.punishments.len(), 1);
}

#[tokio::test]
async fn malformed_commands_are_rejected() {
    let h = harness(MockModerationGateway::new(), quiet_notifier());

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/commands",
        Some(command(10, &[], json!({ "name": "purge" }))),
    )
    .await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn autocomplete_echoes_the_input_last() {
    let h = harness(MockModerationGateway::new(), quiet_notifier());

    let (status, suggestions) =
        call(&h.app, Method::GET, "/autocomplete/accounts?q=ste", None).await;

    assert_eq!(status, StatusCode::OK);
    let suggestions = suggestions.as_array().unwrap();
    assert_eq!(suggestions.len(), 2);
    assert_eq!(suggestions[0]["label"], "Steve");
    assert_eq!(suggestions[1]["value"], "ste");
}

#[tokio::test]
async fn health_reports_the_sweep() {
    let h = harness(MockModerationGateway::new(), quiet_notifier());

    let (status, body) = call(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "sweep_running": false }));

    let (_, ready) = call(&h.app, Method::POST, "/events/ready", None).await;
    assert_eq!(ready["sweep"], "disabled");
}

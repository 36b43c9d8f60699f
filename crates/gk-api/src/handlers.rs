//! # gk-api handlers
//!
//! Each handler turns one gateway delivery into an engine call and the engine's
//! answer into a reply. Failures the operator must see are forwarded to the
//! operator channel before the reply goes out.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gk_core::error::{AppError, Result};
use chrono::Utc;
use gk_core::models::{
    AuditEntry, AuditId, Caller, CommandLog, ModerationNotice, OperatorAlert, PlatformId,
    PunishmentRecord,
};
use gk_services::{
    BanRequest, LinkOutcome, MuteRequest, Suggestion, SyncOutcome, Transition, UnbanRequest,
    UnmuteRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::commands::{Command, CommandRequest, Invoker};
use crate::reply::{Failure, Reply};
use crate::AppState;

pub async fn command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Response {
    let name = request.command.name();
    let described = request.command.describe();
    match dispatch(&state, &request.invoker, request.command).await {
        Ok(reply) => {
            info!(command = name, invoker = request.invoker.id, "command completed");
            log_command(&state, &request.invoker, described, &reply);
            Json(reply).into_response()
        }
        Err(e) => failure(&state, name, e).await,
    }
}

/// Posts the completed command to the command log without holding up the reply.
fn log_command(state: &AppState, invoker: &Invoker, command: String, reply: &Reply) {
    let entry = CommandLog {
        invoker: invoker.id,
        invoker_handle: invoker.handle.clone(),
        command,
        reply_title: reply.title.clone(),
        reply_message: reply.message.clone(),
        occurred_at: Utc::now(),
    };
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        if let Err(e) = notifier.command_log(entry).await {
            warn!(error = %e, "command log entry could not be sent");
        }
    });
}

async fn dispatch(state: &AppState, invoker: &Invoker, command: Command) -> Result<Reply> {
    if command.is_privileged() && !state.access.is_staff(invoker) {
        return Err(AppError::Unauthorized(format!(
            "{} is not staff ({})",
            invoker.id,
            command.name()
        )));
    }

    match command {
        Command::Verify { account } => {
            let outcome = state.linking.self_verify(&Caller::from(invoker), &account).await?;
            Ok(linked(outcome, "You are"))
        }
        Command::StaffVerify { member, account } => {
            let target = caller(state, member).await?;
            let outcome = state
                .linking
                .staff_verify(invoker.id, &target, &account)
                .await?;
            Ok(linked(outcome, &format!("<@{member}> is")))
        }
        Command::ForceVerify {
            member,
            account,
            reason,
        } => {
            let outcome = state
                .linking
                .force_verify(invoker.id, member, &account, &reason)
                .await?;
            Ok(linked(outcome, &format!("<@{member}> is")).field("Reason", reason))
        }
        Command::Unverify => {
            let removed = state.linking.unlink(invoker.id).await?;
            Ok(Reply::success(
                "Unverified",
                format!("You are no longer verified to `{}`.", removed.display_name),
            ))
        }
        Command::StaffUnverify { member } => {
            let removed = state.linking.unlink(member).await?;
            Ok(Reply::success(
                "Unverified",
                format!("<@{member}> is no longer verified to `{}`.", removed.display_name),
            ))
        }
        Command::Update => synced(state.linking.sync_member(invoker.id, None).await?, invoker.id),
        Command::StaffUpdate { member } => {
            synced(state.linking.sync_member(member, None).await?, member)
        }
        Command::Ban {
            member,
            reason,
            history,
            audit_id,
        } => {
            let record = state
                .moderation
                .ban(BanRequest {
                    actor: invoker.id,
                    target: member,
                    reason,
                    history,
                    audit_id,
                })
                .await?;
            Ok(punished("Banned", &record))
        }
        Command::Unban {
            member,
            reason,
            audit_id,
        } => {
            let record = state
                .moderation
                .unban(UnbanRequest {
                    actor: invoker.id,
                    target: member,
                    reason,
                    audit_id,
                })
                .await?;
            Ok(punished("Unbanned", &record))
        }
        Command::Mute {
            member,
            duration,
            reason,
        } => {
            let notice = state
                .moderation
                .mute(MuteRequest {
                    actor: invoker.id,
                    target: member,
                    duration,
                    reason,
                })
                .await?;
            Ok(timed_out("Muted", &notice))
        }
        Command::Unmute { member, reason } => {
            let notice = state
                .moderation
                .unmute(UnmuteRequest {
                    actor: invoker.id,
                    target: member,
                    reason,
                })
                .await?;
            Ok(timed_out("Unmuted", &notice))
        }
    }
}

async fn caller(state: &AppState, member: PlatformId) -> Result<Caller> {
    state
        .directory
        .member(member)
        .await?
        .map(|m| Caller::from(&m))
        .ok_or(AppError::MemberNotFound {
            platform_id: member,
        })
}

fn linked(outcome: LinkOutcome, subject: &str) -> Reply {
    let name = outcome.link().display_name.clone();
    match outcome {
        LinkOutcome::Created(_) => {
            Reply::success("Verified", format!("{subject} now verified to `{name}`."))
        }
        LinkOutcome::Unchanged(_) => {
            Reply::success("Already Verified", format!("{subject} already verified to `{name}`."))
        }
    }
}

fn synced(outcome: SyncOutcome, member: PlatformId) -> Result<Reply> {
    Ok(match outcome {
        SyncOutcome::Synced {
            account,
            rank,
            changes,
        } => Reply::success("Updated", format!("Roles of <@{member}> are up to date."))
            .field("Account", account.display_name)
            .field("Rank", rank.to_string())
            .field("Changes", changes.to_string()),
        SyncOutcome::Desynced { .. } => {
            return Err(AppError::NotLinked {
                platform_id: member,
            })
        }
        SyncOutcome::SkippedBot => {
            Reply::success("Skipped", format!("<@{member}> is a bot and is never verified."))
        }
    })
}

fn punished(title: &str, record: &PunishmentRecord) -> Reply {
    let audit_id = record
        .closure
        .as_ref()
        .map_or(record.audit_id, |closure| closure.closed_audit_id);
    Reply::success(title, format!("<@{}>", record.target_platform_id))
        .field("Audit entry", audit_id.to_string())
}

fn timed_out(title: &str, notice: &ModerationNotice) -> Reply {
    let reply = Reply::success(title, format!("<@{}>", notice.target));
    match notice.expires_at {
        Some(until) => reply.field("Until", format!("<t:{}:f>", until.timestamp())),
        None => reply,
    }
}

/// Logs the failure, alerts the operator when needed, and renders the reply.
async fn failure(state: &AppState, context: &str, e: AppError) -> Response {
    if e.is_user_correctable() {
        debug!(context, error = %e, "request rejected");
    } else if e.needs_operator() {
        error!(context, error = %e, "request failed");
        let alert = OperatorAlert {
            title: format!("`{context}` failed"),
            detail: format!("{e:?}"),
        };
        if let Err(notify) = state.notifier.operator_alert(alert).await {
            warn!(error = %notify, "operator alert could not be sent");
        }
    } else {
        warn!(context, error = %e, "request failed");
    }
    Failure(e).into_response()
}

#[derive(Debug, Serialize)]
pub struct EventReply {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<AuditId>,
}

impl From<&Transition> for EventReply {
    fn from(transition: &Transition) -> Self {
        let (outcome, audit_id) = match transition {
            Transition::Opened(record) => ("opened", Some(record.audit_id)),
            Transition::Closed(record) => (
                "closed",
                record.closure.as_ref().map(|c| c.closed_audit_id),
            ),
            Transition::Duplicate(id) => ("duplicate", Some(*id)),
            Transition::Suppressed(_) => ("suppressed", None),
            Transition::Logged(notice) => ("logged", notice.audit_id),
            Transition::Ignored => ("ignored", None),
        };
        Self { outcome, audit_id }
    }
}

pub async fn audit_event(State(state): State<AppState>, Json(entry): Json<AuditEntry>) -> Response {
    let id = entry.id;
    match state.moderation.on_audit_entry(entry).await {
        Ok(transition) => {
            debug!(audit_id = id, ?transition, "audit notification handled");
            Json(EventReply::from(&transition)).into_response()
        }
        Err(e) => failure(&state, "audit notification", e).await,
    }
}

#[derive(Debug, Deserialize)]
pub struct MemberRemoved {
    pub platform_id: PlatformId,
}

pub async fn member_removed(
    State(state): State<AppState>,
    Json(event): Json<MemberRemoved>,
) -> Response {
    match state.moderation.on_member_removed(event.platform_id).await {
        Ok(transition) => Json(EventReply::from(&transition)).into_response(),
        Err(e) => failure(&state, "member removal", e).await,
    }
}

/// The gateway (re)connected: restart the sweep so it never runs twice.
pub async fn ready(State(state): State<AppState>) -> Response {
    match &state.sweep {
        Some(sweep) => {
            sweep.restart().await;
            (StatusCode::ACCEPTED, Json(json!({ "sweep": "restarted" }))).into_response()
        }
        None => Json(json!({ "sweep": "disabled" })).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AutocompleteQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn autocomplete_accounts(
    State(state): State<AppState>,
    Query(query): Query<AutocompleteQuery>,
) -> Json<Vec<Suggestion>> {
    Json(state.linking.suggest_accounts(&query.q).await)
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sweep_running = match &state.sweep {
        Some(sweep) => sweep.is_running().await,
        None => false,
    };
    Json(json!({ "status": "ok", "sweep_running": sweep_running }))
}

//! Embeds for the moderation and command logs, staff escalations and the operator
//! channel.

use gk_core::models::{
    CommandLog, ModerationAction, ModerationNotice, OperatorAlert, PunishmentRecord,
};

use crate::wire::{Embed, EmbedField};

const RED: u32 = 0xED4245;
const GREEN: u32 = 0x57F287;
const YELLOW: u32 = 0xFEE75C;
const BLURPLE: u32 = 0x5865F2;

/// Embed descriptions are capped well under the platform limit.
pub const DESCRIPTION_LIMIT: usize = 4000;

/// Operator alerts carry raw error dumps; keep them short enough to read.
pub const ALERT_LIMIT: usize = 1800;

/// Cuts `text` to at most `limit` characters, marking the cut.
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn field(name: &str, value: impl Into<String>) -> EmbedField {
    EmbedField {
        name: name.to_string(),
        value: truncate(&value.into(), 1024),
        inline: true,
    }
}

fn mention(id: u64) -> String {
    format!("<@{id}>")
}

pub fn notice(notice: &ModerationNotice) -> Embed {
    let color = match notice.action {
        ModerationAction::Ban => RED,
        ModerationAction::Mute => YELLOW,
        ModerationAction::Unban | ModerationAction::Unmute => GREEN,
    };
    let mut fields = vec![field("Member", mention(notice.target))];
    if let Some(account) = &notice.game_account {
        fields.push(field("Account", format!("`{}`", account.display_name)));
    }
    fields.push(field(
        "By",
        notice.actor.map(mention).unwrap_or_else(|| "unknown".to_string()),
    ));
    if let Some(until) = notice.expires_at {
        fields.push(field("Until", format!("<t:{}:f>", until.timestamp())));
    }
    if let Some(before) = notice.previous_expiry {
        fields.push(field("Previously until", format!("<t:{}:f>", before.timestamp())));
    }
    if let Some(audit_id) = notice.audit_id {
        fields.push(field("Audit entry", audit_id.to_string()));
    }

    Embed {
        title: notice.action.to_string(),
        description: Some(truncate(
            notice.reason.as_deref().unwrap_or("No reason given."),
            DESCRIPTION_LIMIT,
        )),
        color,
        fields,
        timestamp: Some(notice.occurred_at),
    }
}

pub fn missing_reason(record: &PunishmentRecord) -> Embed {
    let by = record
        .opened_by
        .map(mention)
        .unwrap_or_else(|| "whoever issued it".to_string());
    Embed {
        title: "Ban without a reason".to_string(),
        description: Some(format!(
            "{} was banned by {by} without a reason. Please record one for audit entry `{}`.",
            mention(record.target_platform_id),
            record.audit_id
        )),
        color: YELLOW,
        fields: Vec::new(),
        timestamp: Some(record.opened_at),
    }
}

pub fn operator_alert(alert: &OperatorAlert) -> Embed {
    Embed {
        title: truncate(&alert.title, 256),
        description: (!alert.detail.is_empty())
            .then(|| format!("```\n{}\n```", truncate(&alert.detail, ALERT_LIMIT))),
        color: BLURPLE,
        fields: Vec::new(),
        timestamp: Some(chrono::Utc::now()),
    }
}

pub fn command_log(entry: &CommandLog) -> Embed {
    Embed {
        title: truncate(&entry.command, 256),
        description: (!entry.reply_message.is_empty())
            .then(|| truncate(&entry.reply_message, DESCRIPTION_LIMIT)),
        color: BLURPLE,
        fields: vec![
            field(
                "Invoker",
                format!("{} (`{}`)", mention(entry.invoker), entry.invoker_handle),
            ),
            field("Reply", entry.reply_title.clone()),
        ],
        timestamp: Some(entry.occurred_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }

    #[test]
    fn mute_notice_shows_expiry_and_fallback_reason() {
        let at = Utc::now();
        let embed = notice(&ModerationNotice {
            action: ModerationAction::Mute,
            target: 42,
            game_account: None,
            actor: None,
            reason: None,
            audit_id: Some(7),
            previous_expiry: None,
            expires_at: Some(at),
            occurred_at: at,
        });
        assert_eq!(embed.title, "Mute");
        assert_eq!(embed.description.as_deref(), Some("No reason given."));
        assert!(embed.fields.iter().any(|f| f.name == "Until"));
        assert!(embed.fields.iter().any(|f| f.value == "unknown"));
    }

    #[test]
    fn command_log_names_the_invoker_and_reply() {
        let embed = command_log(&CommandLog {
            invoker: 10,
            invoker_handle: "steve".into(),
            command: "/unverify".into(),
            reply_title: "Unverified".into(),
            reply_message: String::new(),
            occurred_at: Utc::now(),
        });
        assert_eq!(embed.title, "/unverify");
        assert!(embed.description.is_none());
        assert_eq!(embed.fields[0].value, "<@10> (`steve`)");
        assert_eq!(embed.fields[1].value, "Unverified");
    }

    #[test]
    fn alert_details_are_fenced_and_capped() {
        let embed = operator_alert(&OperatorAlert {
            title: "Store failure".into(),
            detail: "x".repeat(5000),
        });
        let description = embed.description.unwrap();
        assert!(description.starts_with("```"));
        assert!(description.chars().count() <= ALERT_LIMIT + 8);
    }
}

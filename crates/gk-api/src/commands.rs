//! Command payloads delivered by the gateway.

use gk_core::models::{AuditId, Caller, HistoryWindow, MuteDuration, PlatformId, RoleId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who invoked the command, as the gateway saw them.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoker {
    pub id: PlatformId,
    pub handle: String,
    #[serde(default)]
    pub roles: Vec<RoleId>,
}

impl From<&Invoker> for Caller {
    fn from(invoker: &Invoker) -> Self {
        Caller {
            id: invoker.id,
            handle: invoker.handle.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub invoker: Invoker,
    pub command: Command,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Command {
    Verify {
        account: String,
    },
    Unverify,
    Update,
    StaffVerify {
        member: PlatformId,
        account: String,
    },
    StaffUnverify {
        member: PlatformId,
    },
    StaffUpdate {
        member: PlatformId,
    },
    ForceVerify {
        member: PlatformId,
        account: String,
        reason: String,
    },
    Ban {
        member: PlatformId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        history: HistoryWindow,
        #[serde(default)]
        audit_id: Option<AuditId>,
    },
    Unban {
        member: PlatformId,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        audit_id: Option<AuditId>,
    },
    Mute {
        member: PlatformId,
        duration: MuteDuration,
        #[serde(default)]
        reason: Option<String>,
    },
    Unmute {
        member: PlatformId,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Verify { .. } => "verify",
            Self::Unverify => "unverify",
            Self::Update => "update",
            Self::StaffVerify { .. } => "staff-verify",
            Self::StaffUnverify { .. } => "staff-unverify",
            Self::StaffUpdate { .. } => "staff-update",
            Self::ForceVerify { .. } => "force-verify",
            Self::Ban { .. } => "ban",
            Self::Unban { .. } => "unban",
            Self::Mute { .. } => "mute",
            Self::Unmute { .. } => "unmute",
        }
    }

    /// Everything except the self-service trio needs staff access.
    pub fn is_privileged(&self) -> bool {
        !matches!(self, Self::Verify { .. } | Self::Unverify | Self::Update)
    }

    /// Slash-command form with the given options in name order, e.g.
    /// `/mute duration:one_hour member:42`.
    pub fn describe(&self) -> String {
        let mut line = format!("/{}", self.name());
        let Ok(Value::Object(options)) = serde_json::to_value(self) else {
            return line;
        };
        let mut options: Vec<_> = options.into_iter().collect();
        options.sort_by(|a, b| a.0.cmp(&b.0));
        for (option, value) in options {
            match value {
                _ if option == "name" => {}
                Value::Null => {}
                Value::String(text) => line.push_str(&format!(" {option}:{text}")),
                other => line.push_str(&format!(" {option}:{other}")),
            }
        }
        line
    }
}

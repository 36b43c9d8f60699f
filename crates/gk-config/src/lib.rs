//! # gk-config
//!
//! Layered settings: built-in defaults, then `config/default.toml` and
//! `config/local.toml` when present, then `GATEKEEPER__SECTION__KEY` environment
//! variables. A `.env` file is read into the environment first.

use config::{Config, Environment, File, FileFormat};
use gk_core::models::{PlatformId, Rank, RoleId};
use gk_services::{LinkingSettings, ModerationSettings, RoleLayout, SweepSettings};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULTS: &str = include_str!("../config/default.toml");

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub discord: DiscordSettings,
    pub mojang: MojangSettings,
    pub hypixel: HypixelSettings,
    pub database: DatabaseSettings,
    pub roles: RoleSettings,
    pub access: AccessSettings,
    pub linking: LinkingSection,
    pub moderation: ModerationSection,
    pub sweep: SweepSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Deserialize)]
pub struct DiscordSettings {
    pub token: SecretString,
    pub guild_id: u64,
    /// The bot's own user id.
    pub bot_id: PlatformId,
    pub api_base: String,
    pub timeout_ms: u64,
    /// Moderation log.
    pub log_channel: Option<u64>,
    /// Errors and status notices for whoever runs the bot.
    pub operator_channel: Option<u64>,
    /// Where staff are asked for missing ban reasons.
    pub staff_channel: Option<u64>,
    /// Every completed command, with its reply.
    pub command_log_channel: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MojangSettings {
    pub profile_url: String,
    pub search_url: String,
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct HypixelSettings {
    pub api_key: SecretString,
    pub base_url: String,
    /// Route reputation requests through this proxy.
    pub proxy: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    /// Postgres connection string. Without one the in-memory store is used.
    pub url: Option<SecretString>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSettings {
    pub verified: Option<RoleId>,
    /// Rank name (`mvp_plus`, `vip`, ...) to role id.
    #[serde(default)]
    pub ranks: HashMap<String, RoleId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessSettings {
    pub staff_role: Option<RoleId>,
    #[serde(default)]
    pub owner_ids: Vec<PlatformId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkingSection {
    pub interactive_timeout_ms: u64,
    #[serde(default)]
    pub default_suggestions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationSection {
    pub lookback_secs: u64,
    pub correlation_attempts: u32,
    pub correlation_delay_ms: u64,
    pub audit_page: usize,
    pub suppress_bot_actor: bool,
    pub claim_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepSection {
    pub enabled: bool,
    pub interval_secs: u64,
    pub item_delay_ms: u64,
}

impl Settings {
    /// Reads `.env`, then every configuration layer, and validates the result.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, ".env could not be read"),
        }
        let dir = std::env::var("GATEKEEPER_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let config = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(File::with_name(&format!("{dir}/default")).required(false))
            .add_source(File::with_name(&format!("{dir}/local")).required(false))
            .add_source(
                Environment::with_prefix("GATEKEEPER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("access.owner_ids")
                    .with_list_parse_key("linking.default_suggestions")
                    .try_parsing(true),
            )
            .build()?;
        Self::finish(config)
    }

    /// Defaults overlaid with a TOML document, without touching files or the environment.
    pub fn from_toml(overrides: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.discord.token.expose_secret().trim().is_empty() {
            return Err(invalid("discord.token", "a bot token is required"));
        }
        if self.discord.guild_id == 0 {
            return Err(invalid("discord.guild_id", "the guild to manage is required"));
        }
        if self.discord.bot_id == 0 {
            return Err(invalid("discord.bot_id", "the bot's user id is required"));
        }
        if self.hypixel.api_key.expose_secret().trim().is_empty() {
            return Err(invalid("hypixel.api_key", "an API key is required"));
        }
        if self.mojang.attempts == 0 {
            return Err(invalid("mojang.attempts", "must be at least 1"));
        }
        if self.moderation.correlation_attempts == 0 {
            return Err(invalid("moderation.correlation_attempts", "must be at least 1"));
        }
        self.role_layout().map(|_| ())
    }

    pub fn role_layout(&self) -> Result<RoleLayout> {
        let mut ranks = HashMap::with_capacity(self.roles.ranks.len());
        for (name, role) in &self.roles.ranks {
            let rank = Rank::from_str(name).map_err(|message| invalid("roles.ranks", message))?;
            ranks.insert(rank, *role);
        }
        Ok(RoleLayout {
            verified: self.roles.verified,
            ranks,
        })
    }

    pub fn linking_settings(&self) -> LinkingSettings {
        LinkingSettings {
            interactive_timeout: Duration::from_millis(self.linking.interactive_timeout_ms),
            default_suggestions: self.linking.default_suggestions.clone(),
        }
    }

    pub fn moderation_settings(&self) -> ModerationSettings {
        let m = &self.moderation;
        ModerationSettings {
            bot_id: self.discord.bot_id,
            lookback: Duration::from_secs(m.lookback_secs),
            correlation_attempts: m.correlation_attempts,
            correlation_delay: Duration::from_millis(m.correlation_delay_ms),
            audit_page: m.audit_page,
            suppress_bot_actor: m.suppress_bot_actor,
            claim_grace: Duration::from_secs(m.claim_grace_secs),
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_secs(self.sweep.interval_secs),
            item_delay: Duration::from_millis(self.sweep.item_delay_ms),
        }
    }
}

fn invalid(key: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: &str = r#"
        [discord]
        token = "bot-token"
        guild_id = 1430328872465076417
        bot_id = 1

        [hypixel]
        api_key = "key"
    "#;

    #[test]
    fn defaults_fill_everything_but_secrets() {
        let settings = Settings::from_toml(REQUIRED).unwrap();
        assert_eq!(settings.server.bind, "0.0.0.0:8080");
        assert_eq!(settings.mojang.attempts, 3);
        assert!(settings.database.url.is_none());
        assert_eq!(
            settings.linking_settings().interactive_timeout,
            Duration::from_secs(5)
        );
        assert!(settings.moderation_settings().suppress_bot_actor);
        assert_eq!(settings.moderation_settings().bot_id, 1);
    }

    #[test]
    fn missing_token_is_rejected() {
        let err = Settings::from_toml("[hypixel]\napi_key = \"key\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "discord.token", .. }));
    }

    #[test]
    fn rank_roles_are_parsed() {
        let toml = format!(
            "{REQUIRED}\n[roles]\nverified = 10\nranks = {{ mvp_plus = 20, vip = 30 }}\n"
        );
        let layout = Settings::from_toml(&toml).unwrap().role_layout().unwrap();
        assert_eq!(layout.verified, Some(10));
        assert_eq!(layout.ranks.get(&Rank::MvpPlus), Some(&20));
        assert_eq!(layout.ranks.get(&Rank::Vip), Some(&30));
    }

    #[test]
    fn unknown_rank_is_rejected() {
        let toml = format!("{REQUIRED}\n[roles]\nranks = {{ legend = 20 }}\n");
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "roles.ranks", .. }));
    }
}

//! # Gatekeeper Binary
//!
//! Composition root: loads settings, builds every adapter, wires them into the
//! engines and serves the gateway ingress until SIGINT or SIGTERM.

use anyhow::Context;
use gk_api::{Access, AppState};
use gk_config::{DatabaseSettings, LoggingSettings, Settings};
use gk_core::models::{IdentityLink, OperatorAlert, PunishmentRecord};
use gk_core::traits::{LinkStore, Notifier, PunishmentStore};
use gk_discord::{DiscordClient, DiscordConfig};
use gk_hypixel::{HypixelConfig, HypixelGate};
use gk_mojang::{MojangConfig, MojangResolver};
use gk_services::{LinkingEngine, ReconciliationEngine, SweepSupervisor};
use gk_store_memory::MemoryStore;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "db-postgres")]
use gk_store_postgres::PgDocumentStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "gatekeeper starting");

    let (links, punishments) = stores(&settings.database).await?;

    let discord = Arc::new(
        DiscordClient::new(DiscordConfig {
            api_base: settings.discord.api_base.clone(),
            token: reveal(&settings.discord.token),
            guild_id: settings.discord.guild_id,
            timeout: Duration::from_millis(settings.discord.timeout_ms),
            log_channel: settings.discord.log_channel,
            operator_channel: settings.discord.operator_channel,
            staff_channel: settings.discord.staff_channel,
            command_log_channel: settings.discord.command_log_channel,
        })
        .context("building the chat platform client")?,
    );
    let resolver = MojangResolver::new(MojangConfig {
        profile_url: settings.mojang.profile_url.clone(),
        search_url: settings.mojang.search_url.clone(),
        attempts: settings.mojang.attempts,
        retry_delay: Duration::from_millis(settings.mojang.retry_delay_ms),
        timeout: Duration::from_millis(settings.mojang.timeout_ms),
    })
    .context("building the account lookup client")?;
    let reputation = HypixelGate::new(HypixelConfig {
        base_url: settings.hypixel.base_url.clone(),
        api_key: reveal(&settings.hypixel.api_key),
        proxy: settings.hypixel.proxy.clone(),
        timeout: Duration::from_millis(settings.hypixel.timeout_ms),
    })
    .context("building the reputation client")?;

    let linking = Arc::new(LinkingEngine::new(
        Arc::new(resolver),
        Arc::new(reputation),
        links.clone(),
        discord.clone(),
        settings.role_layout()?,
        settings.linking_settings(),
    ));
    let moderation = Arc::new(ReconciliationEngine::new(
        discord.clone(),
        discord.clone(),
        punishments,
        links,
        discord.clone(),
        settings.moderation_settings(),
    ));

    let sweep = if settings.sweep.enabled {
        let sweep = Arc::new(SweepSupervisor::new(
            linking.clone(),
            discord.clone(),
            settings.sweep_settings(),
        ));
        sweep.restart().await;
        Some(sweep)
    } else {
        info!("member sweep disabled");
        None
    };

    let notifier: Arc<dyn Notifier> = discord.clone();
    let state = AppState {
        linking,
        moderation,
        sweep: sweep.clone(),
        directory: discord.clone(),
        notifier: notifier.clone(),
        access: Access {
            staff_role: settings.access.staff_role,
            owners: settings.access.owner_ids.clone(),
        },
    };

    let listener = tokio::net::TcpListener::bind(&settings.server.bind)
        .await
        .with_context(|| format!("binding {}", settings.server.bind))?;
    info!(addr = %settings.server.bind, "ingress listening");
    status(&*notifier, "Gatekeeper Starting...").await;

    axum::serve(listener, gk_api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving the ingress")?;

    if let Some(sweep) = sweep {
        sweep.shutdown().await;
    }
    status(&*notifier, "Gatekeeper Closing...").await;
    info!("gatekeeper stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Postgres when a URL is configured, memory otherwise.
async fn stores(
    database: &DatabaseSettings,
) -> anyhow::Result<(Arc<LinkStore>, Arc<PunishmentStore>)> {
    if let Some(stores) = postgres(database).await? {
        return Ok(stores);
    }
    warn!("no database configured, links and punishments are kept in memory only");
    let links: Arc<LinkStore> = Arc::new(MemoryStore::<IdentityLink>::new());
    let punishments: Arc<PunishmentStore> = Arc::new(MemoryStore::<PunishmentRecord>::new());
    Ok((links, punishments))
}

#[cfg(feature = "db-postgres")]
async fn postgres(
    database: &DatabaseSettings,
) -> anyhow::Result<Option<(Arc<LinkStore>, Arc<PunishmentStore>)>> {
    let Some(url) = &database.url else {
        return Ok(None);
    };
    let pool = gk_store_postgres::connect(url, database.max_connections)
        .await
        .context("connecting to postgres")?;
    let links: Arc<LinkStore> = Arc::new(
        PgDocumentStore::<IdentityLink>::open(pool.clone())
            .await
            .context("preparing the link table")?,
    );
    let punishments: Arc<PunishmentStore> = Arc::new(
        PgDocumentStore::<PunishmentRecord>::open(pool)
            .await
            .context("preparing the punishment table")?,
    );
    Ok(Some((links, punishments)))
}

#[cfg(not(feature = "db-postgres"))]
async fn postgres(
    database: &DatabaseSettings,
) -> anyhow::Result<Option<(Arc<LinkStore>, Arc<PunishmentStore>)>> {
    if database.url.is_some() {
        warn!("database.url is set but postgres support is not compiled in");
    }
    Ok(None)
}

fn reveal(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

async fn status(notifier: &dyn Notifier, title: &str) {
    let alert = OperatorAlert {
        title: title.to_string(),
        detail: String::new(),
    };
    if let Err(e) = notifier.operator_alert(alert).await {
        warn!(error = %e, "status notice could not be sent");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("interrupt received, shutting down"),
        _ = terminate => info!("terminate received, shutting down"),
    }
}

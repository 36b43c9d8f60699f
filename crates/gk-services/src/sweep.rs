//! Periodic member sweep.
//!
//! Walks every guild member through [`LinkingEngine::sync_member`] with a pause
//! between members, then waits for the next pass. The supervisor owns at most one
//! running sweep: `restart` cancels the current run and waits for it before
//! starting a new one, `shutdown` only cancels.

use gk_core::error::AppError;
use gk_core::traits::MemberDirectory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::linking::{LinkingEngine, SyncOutcome};

#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// Pause between two passes.
    pub interval: Duration,
    /// Pause between two members.
    pub item_delay: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            item_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub synced: usize,
    pub desynced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rate_limited: usize,
    /// Role and nickname edits applied across the pass.
    pub changes: usize,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sweep task ended abnormally");
        }
    }
}

pub struct SweepSupervisor {
    linking: Arc<LinkingEngine>,
    directory: Arc<dyn MemberDirectory>,
    settings: SweepSettings,
    current: Mutex<Option<Running>>,
}

impl SweepSupervisor {
    pub fn new(
        linking: Arc<LinkingEngine>,
        directory: Arc<dyn MemberDirectory>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            linking,
            directory,
            settings,
            current: Mutex::new(None),
        }
    }

    /// Cancels any running sweep, waits for it to finish, then starts a fresh one.
    pub async fn restart(&self) {
        let mut current = self.current.lock().await;
        if let Some(running) = current.take() {
            debug!("cancelling running sweep");
            running.stop().await;
        }

        let (stop, mut stopped) = watch::channel(false);
        let linking = self.linking.clone();
        let directory = self.directory.clone();
        let settings = self.settings.clone();
        let handle = tokio::spawn(async move {
            info!("member sweep started");
            loop {
                let Some(report) = pass(&linking, &*directory, &settings, &mut stopped).await
                else {
                    break;
                };
                info!(
                    synced = report.synced,
                    desynced = report.desynced,
                    skipped = report.skipped,
                    failed = report.failed,
                    rate_limited = report.rate_limited,
                    changes = report.changes,
                    "sweep pass finished"
                );
                if !pause(settings.interval, &mut stopped).await {
                    break;
                }
            }
            info!("member sweep stopped");
        });
        *current = Some(Running { stop, handle });
    }

    /// Cancels the running sweep, if any, and waits for it.
    pub async fn shutdown(&self) {
        if let Some(running) = self.current.lock().await.take() {
            running.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// One pass in the caller's task, outside supervision.
    pub async fn run_once(&self) -> SweepReport {
        let (_stop, mut stopped) = watch::channel(false);
        pass(&self.linking, &*self.directory, &self.settings, &mut stopped)
            .await
            .unwrap_or_default()
    }
}

/// `None` when cancelled part-way.
async fn pass(
    linking: &LinkingEngine,
    directory: &dyn MemberDirectory,
    settings: &SweepSettings,
    stopped: &mut watch::Receiver<bool>,
) -> Option<SweepReport> {
    let mut report = SweepReport::default();
    let ids = match directory.member_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "member listing failed, skipping pass");
            return Some(report);
        }
    };

    for (index, platform_id) in ids.into_iter().enumerate() {
        if index > 0 && !pause(settings.item_delay, stopped).await {
            return None;
        }
        let outcome = tokio::select! {
            biased;
            _ = stopped.changed() => return None,
            outcome = linking.sync_member(platform_id, None) => outcome,
        };
        match outcome {
            Ok(SyncOutcome::Synced { changes, .. }) => {
                report.synced += 1;
                report.changes += changes;
            }
            Ok(SyncOutcome::Desynced { changes }) => {
                report.desynced += 1;
                report.changes += changes;
            }
            Ok(SyncOutcome::SkippedBot) => report.skipped += 1,
            Err(AppError::RateLimited { service, retry_after }) => {
                report.rate_limited += 1;
                warn!(platform_id, service, ?retry_after, "sweep rate limited, backing off");
                if !pause(retry_after, stopped).await {
                    return None;
                }
            }
            Err(AppError::MemberNotFound { .. }) => {
                debug!(platform_id, "member left during sweep");
                report.skipped += 1;
            }
            Err(e) => {
                report.failed += 1;
                warn!(platform_id, error = %e, "member sync failed");
            }
        }
    }
    Some(report)
}

/// Sleeps unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, stopped: &mut watch::Receiver<bool>) -> bool {
    if *stopped.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        _ = stopped.changed() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

//! Correlation between commands the bot executes and the audit notifications they
//! cause.
//!
//! A command registers a claim on `(target, action)` before calling the platform.
//! While the claim is live, or for a grace period after the command completes, a
//! matching notification is handed to the command instead of being processed a second
//! time. A command that fails withdraws its claim, so later notifications are processed
//! normally.

use dashmap::DashMap;
use gk_core::models::{AuditId, ModerationAction, PlatformId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

struct Slot {
    token: u64,
    delivered: Option<AuditId>,
    /// `None` while the command is still running.
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct ClaimRegistry {
    slots: DashMap<(PlatformId, ModerationAction), Slot>,
    next_token: AtomicU64,
    grace: Duration,
}

impl ClaimRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            next_token: AtomicU64::new(1),
            grace,
        }
    }

    /// Registers intent to perform `action` on `target`. A newer claim replaces an
    /// older one on the same key.
    pub fn claim(&self, target: PlatformId, action: ModerationAction) -> Claim<'_> {
        let now = Instant::now();
        self.slots.retain(|_, slot| slot.live(now));

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(
            (target, action),
            Slot {
                token,
                delivered: None,
                expires_at: None,
            },
        );
        Claim {
            registry: self,
            key: (target, action),
            token,
            completed: false,
        }
    }

    /// Offers a notification to a live claim. Returns `true` when a claim owns it,
    /// in which case the caller must not process it.
    pub fn offer(&self, target: PlatformId, action: ModerationAction, audit_id: AuditId) -> bool {
        let now = Instant::now();
        let Some(mut slot) = self.slots.get_mut(&(target, action)) else {
            return false;
        };
        if !slot.live(now) {
            drop(slot);
            self.slots
                .remove_if(&(target, action), |_, slot| !slot.live(now));
            return false;
        }
        match slot.delivered {
            None => {
                slot.delivered = Some(audit_id);
                true
            }
            Some(id) => id == audit_id,
        }
    }

    /// Number of claims currently registered, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A live claim. [`Claim::complete`] starts the grace period; dropping it otherwise
/// withdraws it.
pub struct Claim<'a> {
    registry: &'a ClaimRegistry,
    key: (PlatformId, ModerationAction),
    token: u64,
    completed: bool,
}

impl Claim<'_> {
    /// The audit id a notification delivered to this claim, if one arrived.
    pub fn delivered(&self) -> Option<AuditId> {
        self.registry
            .slots
            .get(&self.key)
            .filter(|slot| slot.token == self.token)
            .and_then(|slot| slot.delivered)
    }

    /// The command took effect and is on record; keep catching its echo for the grace period.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.completed {
            if let Some(mut slot) = self.registry.slots.get_mut(&self.key) {
                if slot.token == self.token {
                    slot.expires_at = Some(Instant::now() + self.registry.grace);
                }
            }
            return;
        }
        let token = self.token;
        if let Some((key, slot)) = self
            .registry
            .slots
            .remove_if(&self.key, |_, slot| slot.token == token)
        {
            if let Some(audit_id) = slot.delivered {
                warn!(member = key.0, audit_id, "claim withdrawn after taking a notification");
            }
        }
    }
}

/// Audit ids already handled, for notifications that carry no stored state.
pub struct SeenAudits {
    ids: DashMap<AuditId, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl SeenAudits {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ids: DashMap::new(),
            ttl,
            capacity,
        }
    }

    /// `true` the first time an id is seen.
    pub fn first_sight(&self, id: AuditId) -> bool {
        let now = Instant::now();
        if self.ids.len() >= self.capacity {
            self.ids
                .retain(|_, seen| now.duration_since(*seen) < self.ttl);
        }
        self.ids.insert(id, now).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_claim_takes_the_first_notification() {
        let claims = ClaimRegistry::new(Duration::from_secs(30));
        let claim = claims.claim(42, ModerationAction::Ban);
        assert!(claims.offer(42, ModerationAction::Ban, 900));
        assert_eq!(claim.delivered(), Some(900));

        // A different entry for the same target is not this command's echo.
        assert!(!claims.offer(42, ModerationAction::Ban, 901));
        // Nor is another action or another target.
        assert!(!claims.offer(42, ModerationAction::Unban, 900));
        assert!(!claims.offer(43, ModerationAction::Ban, 900));
    }

    #[test]
    fn echo_after_the_command_is_caught_during_grace() {
        let claims = ClaimRegistry::new(Duration::from_secs(30));
        claims.claim(42, ModerationAction::Mute).complete();
        assert!(claims.offer(42, ModerationAction::Mute, 77));
    }

    #[test]
    fn expired_claims_release_notifications() {
        let claims = ClaimRegistry::new(Duration::ZERO);
        claims.claim(42, ModerationAction::Ban).complete();
        assert!(!claims.offer(42, ModerationAction::Ban, 900));
        assert!(claims.is_empty());
    }

    #[test]
    fn abandoned_claim_is_withdrawn_at_once() {
        let claims = ClaimRegistry::new(Duration::from_secs(30));
        drop(claims.claim(42, ModerationAction::Ban));
        assert!(claims.is_empty());
        assert!(!claims.offer(42, ModerationAction::Ban, 900));
    }

    #[test]
    fn newer_claim_replaces_older() {
        let claims = ClaimRegistry::new(Duration::from_secs(30));
        let old = claims.claim(42, ModerationAction::Ban);
        let new = claims.claim(42, ModerationAction::Ban);
        assert!(claims.offer(42, ModerationAction::Ban, 900));
        assert_eq!(old.delivered(), None);
        assert_eq!(new.delivered(), Some(900));
        drop(old);
        assert_eq!(claims.len(), 1);
        new.complete();
        assert_eq!(claims.len(), 1);
    }

    #[test]
    fn seen_audits_report_first_sight_once() {
        let seen = SeenAudits::new(Duration::from_secs(60), 16);
        assert!(seen.first_sight(5));
        assert!(!seen.first_sight(5));
        assert!(seen.first_sight(6));
    }
}

//! gatekeeper/crates/gk-services/src/lib.rs
//!
//! The two engines (identity linking and moderation reconciliation), the
//! concurrency primitives they share, and the supervised member sweep.

pub mod correlation;
pub mod linking;
pub mod locks;
pub mod moderation;
pub mod roles;
pub mod sweep;

pub use linking::{LinkOutcome, LinkingEngine, LinkingSettings, Suggestion, SyncOutcome};
pub use moderation::{
    BanRequest, ModerationSettings, MuteRequest, ReconciliationEngine, Suppression, Transition,
    UnbanRequest, UnmuteRequest,
};
pub use roles::{RoleDiff, RoleLayout};
pub use sweep::{SweepReport, SweepSettings, SweepSupervisor};

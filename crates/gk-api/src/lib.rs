//! # gk-api
//!
//! HTTP ingress for the chat-platform gateway: commands, audit and membership
//! events, autocomplete, and a health probe.

pub mod commands;
pub mod handlers;
pub mod middleware;
pub mod reply;

use axum::routing::{get, post};
use axum::Router;
use gk_core::models::{PlatformId, RoleId};
use gk_core::traits::{MemberDirectory, Notifier};
use gk_services::{LinkingEngine, ReconciliationEngine, SweepSupervisor};
use std::sync::Arc;

use crate::commands::Invoker;

/// Who may run staff and moderation commands.
#[derive(Debug, Clone, Default)]
pub struct Access {
    pub staff_role: Option<RoleId>,
    pub owners: Vec<PlatformId>,
}

impl Access {
    pub fn is_staff(&self, invoker: &Invoker) -> bool {
        self.owners.contains(&invoker.id)
            || self
                .staff_role
                .is_some_and(|role| invoker.roles.contains(&role))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub linking: Arc<LinkingEngine>,
    pub moderation: Arc<ReconciliationEngine>,
    /// Absent when the sweep is disabled.
    pub sweep: Option<Arc<SweepSupervisor>>,
    pub directory: Arc<dyn MemberDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub access: Access,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/commands", post(handlers::command))
        .route("/events/audit", post(handlers::audit_event))
        .route("/events/member-removed", post(handlers::member_removed))
        .route("/events/ready", post(handlers::ready))
        .route("/autocomplete/accounts", get(handlers::autocomplete_accounts))
        .route("/health", get(handlers::health))
        .layer(middleware::trace_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoker(id: PlatformId, roles: Vec<RoleId>) -> Invoker {
        Invoker {
            id,
            handle: "someone".into(),
            roles,
        }
    }

    #[test]
    fn staff_role_or_owner_grants_access() {
        let access = Access {
            staff_role: Some(7),
            owners: vec![1],
        };
        assert!(access.is_staff(&invoker(1, vec![])));
        assert!(access.is_staff(&invoker(2, vec![3, 7])));
        assert!(!access.is_staff(&invoker(2, vec![3])));
        assert!(!Access::default().is_staff(&invoker(2, vec![7])));
    }
}

//! # AppError
//!
//! Centralized error handling for the Gatekeeper workspace.
//! Every failure is one closed variant, and [`AppError::kind`] classifies it
//! exhaustively so callers can decide how to surface it.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::{GameAccount, IdentityLink, PlatformId};

/// Which side of the link relation is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    /// The platform member is linked to a different game account.
    Platform,
    /// The game account is linked to a different platform member.
    Account,
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Platform => "platform member",
            Self::Account => "game account",
        })
    }
}

/// A punishment signal that could not be tied to stored state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityViolation {
    #[error("no {action} audit entry for {target} within the lookback window")]
    UncorrelatedAudit {
        target: PlatformId,
        action: &'static str,
    },
    #[error("no open punishment on record for {target}")]
    NoOpenPunishment { target: PlatformId },
}

/// Failures raised by document store backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The insert collided with an existing key or unique field.
    #[error("duplicate key `{key}` in {collection}")]
    DuplicateKey {
        collection: &'static str,
        key: String,
    },

    #[error("malformed document in {collection}: {message}")]
    Corrupt {
        collection: &'static str,
        message: String,
    },

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Classification used to pick a user-facing treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unauthorized,
    Validation,
    ExternalService,
    RateLimited,
    Integrity,
    Permission,
    Internal,
}

/// The primary error type for all Gatekeeper operations.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("no game account matches `{reference}`")]
    AccountNotFound { reference: String },

    #[error("member {platform_id} is not linked")]
    NotLinked { platform_id: PlatformId },

    #[error("member {platform_id} not found")]
    MemberNotFound { platform_id: PlatformId },

    /// The reputation record does not name the caller's handle.
    #[error(
        "{} publishes handle {claimed:?}, expected `{expected}`",
        .account.display_name
    )]
    OwnershipMismatch {
        expected: String,
        claimed: Option<String>,
        account: GameAccount,
    },

    #[error("{side} already linked ({existing:?}); attempted {attempted_platform} -> {}", .attempted_account.display_name)]
    IdentityAlreadyLinked {
        side: LinkSide,
        existing: Box<IdentityLink>,
        attempted_platform: PlatformId,
        attempted_account: GameAccount,
    },

    #[error("member {target} already has an open ban (audit {audit_id})")]
    AlreadyPunished { target: PlatformId, audit_id: u64 },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// Upstream lookup, reputation, or platform service failed. Retryable by the caller.
    #[error("{service} unavailable: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("{service} is rate limiting us, retry after {retry_after:?}")]
    RateLimited {
        service: &'static str,
        retry_after: Duration,
    },

    #[error("integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    /// Role or nickname edits the platform refused.
    #[error("missing permission to {action}: {message}")]
    Permission { action: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal service error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AccountNotFound { .. } | Self::NotLinked { .. } | Self::MemberNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::IdentityAlreadyLinked { .. } | Self::AlreadyPunished { .. } => {
                ErrorKind::Conflict
            }
            Self::OwnershipMismatch { .. } | Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Validation(_) => ErrorKind::Validation,
            Self::ExternalService { .. } => ErrorKind::ExternalService,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::Store(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Errors the user can fix by changing their input.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound | ErrorKind::Conflict | ErrorKind::Unauthorized | ErrorKind::Validation
        )
    }

    /// Errors that must reach the operator channel instead of only the log.
    pub fn needs_operator(&self) -> bool {
        matches!(self.kind(), ErrorKind::Integrity | ErrorKind::Internal)
    }

    pub fn external(service: &'static str, message: impl fmt::Display) -> Self {
        Self::ExternalService {
            service,
            message: message.to_string(),
        }
    }
}

/// A specialized Result type for Gatekeeper logic.
pub type Result<T> = std::result::Result<T, AppError>;

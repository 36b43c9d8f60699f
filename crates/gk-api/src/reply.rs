//! Response bodies and the error-to-status mapping.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use gk_core::error::{AppError, ErrorKind, LinkSide};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyField {
    pub name: String,
    pub value: String,
}

/// What the gateway shows the invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub ok: bool,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ReplyField>,
}

impl Reply {
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: true,
            title: title.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            ..Self::success(title, message)
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(ReplyField {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

pub fn status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized | ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ExternalService => StatusCode::BAD_GATEWAY,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Integrity | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The reply shown for a failed command. Internal details never reach the invoker.
pub fn render(error: &AppError) -> Reply {
    match error {
        AppError::AccountNotFound { reference } => Reply::error(
            "Account Not Found",
            format!("No game account named `{reference}` was found."),
        ),
        AppError::NotLinked { .. } => Reply::error(
            "Not Verified",
            "This command is only accessible to verified users. Please use `/verify` and try again.",
        ),
        AppError::MemberNotFound { platform_id } => Reply::error(
            "Member Not Found",
            format!("The member you are trying to target was not found (`{platform_id}`)."),
        ),
        AppError::OwnershipMismatch {
            expected,
            claimed,
            account,
        } => Reply::error(
            "Handle Mismatch",
            "The account does not publish your handle. Link it in-game and try again.",
        )
        .field("Account", account.display_name.clone())
        .field("Your handle", expected.clone())
        .field("Linked handle", claimed.clone().unwrap_or_else(|| "none".to_string())),
        AppError::IdentityAlreadyLinked {
            side: LinkSide::Platform,
            existing,
            ..
        } => Reply::error(
            "Already Verified",
            format!(
                "You are already verified to `{}` and cannot verify to two accounts at once. Please use `/unverify` and try again.",
                existing.display_name
            ),
        ),
        AppError::IdentityAlreadyLinked {
            side: LinkSide::Account,
            existing,
            attempted_account,
            ..
        } => Reply::error(
            "Already Verified",
            format!(
                "`{}` is already verified to <@{}>. The same game account cannot be verified to two members.",
                attempted_account.display_name, existing.platform_id
            ),
        ),
        AppError::AlreadyPunished { target, audit_id } => Reply::error(
            "Already Banned",
            format!("<@{target}> already has an open ban (audit entry `{audit_id}`)."),
        ),
        AppError::Unauthorized(_) => Reply::error(
            "Unauthorized",
            "You do not have permission to use this command.",
        ),
        AppError::Validation(message) => Reply::error("Invalid Input", message.clone()),
        AppError::ExternalService { service, .. } => Reply::error(
            "Service Unavailable",
            format!("The {service} service is not responding. Please try again later."),
        ),
        AppError::RateLimited {
            service,
            retry_after,
        } => Reply::error(
            "Rate Limited",
            format!(
                "The {service} service is rate limiting us. Please try again in {} seconds.",
                retry_after.as_secs().max(1)
            ),
        ),
        AppError::Permission { action, .. } => Reply::error(
            "Missing Permission",
            format!("I am missing the permission to {action}."),
        ),
        AppError::Integrity(_) | AppError::Store(_) | AppError::Internal(_) => Reply::error(
            "An Unknown Error Occurred",
            "This error has been forwarded to the bot developer. Please try again later.",
        ),
    }
}

/// A failed request: the status from the error's kind and the rendered reply.
#[derive(Debug)]
pub struct Failure(pub AppError);

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let mut response = (status(self.0.kind()), Json(render(&self.0))).into_response();
        if let AppError::RateLimited { retry_after, .. } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gk_core::error::{IntegrityViolation, StoreError};
    use std::time::Duration;

    #[test]
    fn every_kind_has_a_status() {
        assert_eq!(status(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status(ErrorKind::Permission), StatusCode::FORBIDDEN);
        assert_eq!(status(ErrorKind::Validation), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(status(ErrorKind::ExternalService), StatusCode::BAD_GATEWAY);
        assert_eq!(status(ErrorKind::Integrity), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn internal_details_stay_hidden() {
        for error in [
            AppError::from(StoreError::Backend("connection refused at 10.0.0.3".into())),
            AppError::from(IntegrityViolation::NoOpenPunishment { target: 42 }),
        ] {
            let reply = render(&error);
            assert!(!reply.ok);
            assert!(!reply.message.contains("10.0.0.3"));
            assert_eq!(reply.title, "An Unknown Error Occurred");
        }
    }

    #[test]
    fn throttling_sets_retry_after() {
        let response = Failure(AppError::RateLimited {
            service: "reputation",
            retry_after: Duration::from_secs(30),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
    }
}

//! Password reset and invitation acceptance.
//!
//! Both flows run on one-time tokens delivered by email. The reset
//! request always answers 204 so the endpoint cannot be used to probe
//! which emails exist. Confirming a reset revokes every session for the
//! identity in the same transaction that installs the new hash.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;

use super::state::AuthState;
use super::storage::{
    TokenPurpose, activate_identity, consume_one_time_token, delete_sessions_for_identity,
    identity_by_email, identity_email, insert_one_time_token, update_password,
};
use super::types::{InvitationAcceptRequest, PasswordResetConfirmRequest, PasswordResetRequest};
use super::utils::{extract_client_ip, hash_password, normalize_email, valid_email};
use crate::api::email::{EmailMessage, enqueue_email};
use crate::audit::{AuditLedger, NewAuditRecord, Outcome, PgLedger};

const MIN_PASSWORD_LENGTH: usize = 12;

fn password_too_short(password: &SecretString) -> bool {
    password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH
}

#[utoipa::path(
    post,
    path = "/v1/password-reset/request",
    request_body = PasswordResetRequest,
    responses(
        (status = 204, description = "If the email exists, a reset link was queued")
    ),
    tag = "auth"
)]
pub async fn password_reset_request(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    auth_state: Extension<Arc<AuthState>>,
    Json(body): Json<PasswordResetRequest>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    if !valid_email(&email) {
        return StatusCode::NO_CONTENT.into_response();
    }

    let identity = match identity_by_email(&pool, &email).await {
        Ok(identity) => identity,
        Err(err) => {
            error!("Failed to look up identity: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    // Unknown emails get the same 204 as known ones.
    let Some(identity) = identity.filter(|identity| identity.active) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let result: anyhow::Result<()> = async {
        let mut tx = pool.begin().await?;
        let token = insert_one_time_token(
            &mut tx,
            identity.id,
            TokenPurpose::PasswordReset,
            auth_state.config.reset_token_ttl,
        )
        .await?;
        let link = format!(
            "{}/password-reset?token={token}",
            auth_state.config.frontend_base_url
        );
        enqueue_email(
            &mut tx,
            &EmailMessage {
                to_email: identity.email.clone(),
                subject: "Reset your password".to_string(),
                html_body: format!(
                    "<p>A password reset was requested for your account. \
                     <a href=\"{link}\">Choose a new password</a>. \
                     The link expires shortly. If this wasn't you, ignore this email.</p>"
                ),
                text_body: format!(
                    "A password reset was requested for your account.\n\
                     Choose a new password: {link}\n\
                     The link expires shortly. If this wasn't you, ignore this email."
                ),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        error!("Failed to queue password reset: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let record = NewAuditRecord::global(
        &identity.email,
        "auth.password_reset_requested",
        Outcome::Success,
    )
    .with_actor(identity.id)
    .with_ip(extract_client_ip(&headers));
    ledger.append_best_effort(&record).await;

    StatusCode::NO_CONTENT.into_response()
}

#[utoipa::path(
    post,
    path = "/v1/password-reset/confirm",
    request_body = PasswordResetConfirmRequest,
    responses(
        (status = 204, description = "Password replaced, all sessions revoked"),
        (status = 401, description = "Unauthorized"),
        (status = 422, description = "Password does not meet the minimum length")
    ),
    tag = "auth"
)]
pub async fn password_reset_confirm(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    Json(body): Json<PasswordResetConfirmRequest>,
) -> impl IntoResponse {
    if password_too_short(&body.new_password) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "Password too short").into_response();
    }
    let password_hash = match hash_password(&body.new_password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let ip = extract_client_ip(&headers);

    let result: anyhow::Result<Option<()>> = async {
        let mut tx = pool.begin().await?;
        let Some(identity_id) =
            consume_one_time_token(&mut tx, &body.token, TokenPurpose::PasswordReset).await?
        else {
            return Ok(None);
        };
        let email = identity_email(&mut tx, identity_id)
            .await?
            .unwrap_or_default();
        update_password(&mut tx, identity_id, &password_hash).await?;
        // Every open session dies with the old password.
        delete_sessions_for_identity(&mut tx, identity_id).await?;
        let record = NewAuditRecord::global(&email, "auth.password_reset", Outcome::Success)
            .with_actor(identity_id)
            .with_ip(ip.clone());
        PgLedger::append_in_tx(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(()))
    }
    .await;

    match result {
        Ok(Some(())) => StatusCode::NO_CONTENT.into_response(),
        // Expired, consumed, and unknown tokens are indistinguishable.
        Ok(None) => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        Err(err) => {
            error!("Failed to confirm password reset: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/invitations/accept",
    request_body = InvitationAcceptRequest,
    responses(
        (status = 204, description = "Account activated; log in to register a passkey"),
        (status = 401, description = "Unauthorized"),
        (status = 422, description = "Password does not meet the minimum length")
    ),
    tag = "auth"
)]
pub async fn invitation_accept(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    Json(body): Json<InvitationAcceptRequest>,
) -> impl IntoResponse {
    if password_too_short(&body.password) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "Password too short").into_response();
    }
    let password_hash = match hash_password(&body.password) {
        Ok(hash) => hash,
        Err(err) => {
            error!("Failed to hash password: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let ip = extract_client_ip(&headers);

    let result: anyhow::Result<Option<()>> = async {
        let mut tx = pool.begin().await?;
        let Some(identity_id) =
            consume_one_time_token(&mut tx, &body.token, TokenPurpose::Invitation).await?
        else {
            return Ok(None);
        };
        let email = identity_email(&mut tx, identity_id)
            .await?
            .unwrap_or_default();
        update_password(&mut tx, identity_id, &password_hash).await?;
        activate_identity(&mut tx, identity_id).await?;
        let record = NewAuditRecord::global(&email, "auth.invitation_accepted", Outcome::Success)
            .with_actor(identity_id)
            .with_ip(ip.clone());
        PgLedger::append_in_tx(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(Some(()))
    }
    .await;

    match result {
        Ok(Some(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(None) => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        Err(err) => {
            error!("Failed to accept invitation: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_passwords_are_rejected() {
        assert!(password_too_short(&SecretString::from("short")));
        assert!(password_too_short(&SecretString::from("elevenchars")));
        assert!(!password_too_short(&SecretString::from("twelve chars")));
    }
}

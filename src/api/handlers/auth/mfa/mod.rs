//! Second-factor endpoints: passkey setup, passkey assertion, backup
//! codes.
//!
//! Passkeys are the second factor for every role. Backup codes exist for
//! sysadmins only, as the deliberately narrow fallback for a lost
//! authenticator; admin and caregiver recovery goes through support.

pub mod recovery;
pub mod storage;

#[cfg(test)]
mod integration_tests;

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use webauthn_rs::prelude::CredentialID;

use super::principal::{require_auth, require_mfa, session_cookie};
use super::state::AuthState;
use super::storage::{delete_session, insert_session, set_mfa_setup_complete};
use super::types::{
    BackupCodesResponse, SessionResponse, SetupChallengeResponse, SetupConfirmRequest,
    SetupConfirmResponse, VerifyBackupCodeRequest, VerifyPasskeyRequest,
};
use super::utils::{extract_client_ip, hash_token};
use crate::audit::{AuditLedger, NewAuditRecord, Outcome, PgLedger};
use crate::authz::Role;
use crate::webauthn::{PasskeyRepo, serialize_credential};
use recovery::BackupCodeBatch;
use secrecy::ExposeSecret;
use storage::ConsumeOutcome;

#[utoipa::path(
    post,
    path = "/v1/mfa/setup",
    responses(
        (status = 200, description = "Registration challenge issued", body = SetupChallengeResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn setup(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // Setup sessions are allowed here; this is the endpoint they exist for.
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let existing = match PasskeyRepo::list_for_identity(&pool, principal.identity_id).await {
        Ok(rows) => rows,
        Err(err) => {
            error!("Failed to list passkeys: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let exclude: Vec<CredentialID> = existing
        .into_iter()
        .map(|row| CredentialID::from(row.credential_id))
        .collect();

    // Bind the challenge to this session so the confirming request must
    // come from the same caller.
    let session_hash = hash_token(&principal.token);
    let (registration_id, challenge) = match auth_state
        .ceremony
        .register_begin(principal.identity_id, &principal.email, session_hash, exclude)
        .await
    {
        Ok(pair) => pair,
        Err(err) => {
            error!("Failed to start passkey registration: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        StatusCode::OK,
        Json(SetupChallengeResponse {
            registration_id,
            challenge,
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/mfa/setup/confirm",
    request_body = SetupConfirmRequest,
    responses(
        (status = 200, description = "Passkey registered, session upgraded", body = SetupConfirmResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn setup_confirm(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    auth_state: Extension<Arc<AuthState>>,
    Json(body): Json<SetupConfirmRequest>,
) -> impl IntoResponse {
    let principal = match require_auth(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let session_hash = hash_token(&principal.token);
    let credential = match auth_state
        .ceremony
        .register_finish(
            body.registration_id,
            principal.identity_id,
            &session_hash,
            &body.credential,
        )
        .await
    {
        Ok(credential) => credential,
        Err(err) => {
            error!("Passkey registration failed: {err}");
            let record = NewAuditRecord::global(
                &principal.email,
                "auth.mfa_setup",
                Outcome::Failure,
            )
            .with_actor(principal.identity_id)
            .with_ip(extract_client_ip(&headers));
            ledger.append_best_effort(&record).await;
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let passkey_data = match serialize_credential(&credential) {
        Ok(data) => data,
        Err(err) => {
            error!("Failed to serialize credential: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let credential_id: Vec<u8> = credential.cred_id().as_slice().to_vec();
    if let Err(err) = PasskeyRepo::create(
        &pool,
        principal.identity_id,
        &credential_id,
        &passkey_data,
        0,
        body.label.as_deref(),
    )
    .await
    {
        error!("Failed to store passkey: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Err(err) = set_mfa_setup_complete(&pool, principal.identity_id).await {
        error!("Failed to mark MFA setup complete: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    // Sysadmins get their recovery batch at first setup; it never appears
    // again.
    let backup_codes = if principal.role == Role::Sysadmin {
        let batch = match BackupCodeBatch::generate(&auth_state.config.backup_code_pepper) {
            Ok(batch) => batch,
            Err(err) => {
                error!("Failed to generate backup codes: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let mut tx = match pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                error!("Failed to start transaction: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        let stored = storage::insert_batch(&mut tx, principal.identity_id, &batch).await;
        let committed = match stored {
            Ok(()) => tx.commit().await.map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            error!("Failed to store backup codes: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        Some(batch.codes)
    } else {
        None
    };

    // Swap the setup session for a full one.
    if let Err(err) = delete_session(&pool, &principal.token).await {
        error!("Failed to drop setup session: {err}");
    }
    let token = match insert_session(
        &pool,
        principal.identity_id,
        auth_state.config.session_ttl,
        true,
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let record = NewAuditRecord::global(&principal.email, "auth.mfa_setup", Outcome::Success)
        .with_actor(principal.identity_id)
        .with_ip(extract_client_ip(&headers));
    if let Err(err) = ledger.append(&record).await {
        error!("Failed to append audit record: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&auth_state.config, &token) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        StatusCode::OK,
        response_headers,
        Json(SetupConfirmResponse {
            token,
            backup_codes,
        }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/mfa/verify-passkey",
    request_body = VerifyPasskeyRequest,
    responses(
        (status = 200, description = "Second factor verified", body = SessionResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn verify_passkey(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    auth_state: Extension<Arc<AuthState>>,
    Json(body): Json<VerifyPasskeyRequest>,
) -> impl IntoResponse {
    let ip = extract_client_ip(&headers);
    // Unknown, expired, and already-used login ids all look the same.
    let Some(pending) = auth_state.take_pending_login(body.login_id).await else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };
    let Some(auth_id) = pending.auth_id else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    let result = match auth_state
        .ceremony
        .assert_finish(auth_id, pending.identity_id, &body.credential)
        .await
    {
        Ok(result) => result,
        Err(err) => {
            error!("Passkey assertion failed: {err}");
            let record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Failure)
                .with_actor(pending.identity_id)
                .with_ip(ip);
            ledger.append_best_effort(&record).await;
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    };

    let credential_id: Vec<u8> = result.cred_id().as_slice().to_vec();
    let stored = match PasskeyRepo::get_by_credential(&pool, &credential_id).await {
        Ok(Some(row)) if row.identity_id == pending.identity_id => row,
        Ok(_) => {
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
        Err(err) => {
            error!("Failed to load passkey: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let new_count = i64::from(result.counter());
    if new_count == 0 {
        // Authenticator without counter support; nothing to compare.
        if let Err(err) = PasskeyRepo::touch(&pool, &credential_id).await {
            error!("Failed to touch passkey: {err}");
        }
    } else {
        let advanced = match PasskeyRepo::record_assertion(&pool, &credential_id, new_count).await {
            Ok(advanced) => advanced,
            Err(err) => {
                error!("Failed to record assertion: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };
        if !advanced {
            // Counter did not move forward: possible cloned credential.
            error!(
                passkey = %stored.id,
                stored_count = stored.sign_count,
                presented_count = new_count,
                "passkey counter regression"
            );
            let record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Failure)
                .with_actor(pending.identity_id)
                .with_ip(ip)
                .with_detail("counter_regression");
            if let Err(err) = ledger.append(&record).await {
                error!("Failed to append audit record: {err}");
            }
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let token = match insert_session(
        &pool,
        pending.identity_id,
        auth_state.config.session_ttl,
        true,
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Success)
        .with_actor(pending.identity_id)
        .with_ip(ip)
        .with_detail("passkey");
    if let Err(err) = ledger.append(&record).await {
        error!("Failed to append audit record: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&auth_state.config, &token) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        StatusCode::OK,
        response_headers,
        Json(SessionResponse { token }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/mfa/verify-backup-code",
    request_body = VerifyBackupCodeRequest,
    responses(
        (status = 200, description = "Backup code accepted", body = SessionResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "mfa"
)]
pub async fn verify_backup_code(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    auth_state: Extension<Arc<AuthState>>,
    Json(body): Json<VerifyBackupCodeRequest>,
) -> impl IntoResponse {
    let ip = extract_client_ip(&headers);
    let Some(pending) = auth_state.take_pending_login(body.login_id).await else {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    // Switching to the fallback invalidates the outstanding passkey
    // challenge.
    if let Some(auth_id) = pending.auth_id {
        auth_state.ceremony.cancel_assertion(auth_id).await;
    }

    if pending.role != Role::Sysadmin {
        let record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Failure)
            .with_actor(pending.identity_id)
            .with_ip(ip)
            .with_detail("backup_code_wrong_role");
        ledger.append_best_effort(&record).await;
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let success_record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Success)
        .with_actor(pending.identity_id)
        .with_ip(ip.clone())
        .with_detail("backup_code");
    let outcome = match storage::consume_code(
        &pool,
        &auth_state.config.backup_code_pepper,
        pending.identity_id,
        body.code.expose_secret(),
        &success_record,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Failed to consume backup code: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match outcome {
        ConsumeOutcome::Consumed => {}
        ConsumeOutcome::AlreadyUsed => {
            // The reuse is only distinguished in the audit detail; the
            // response stays indistinguishable from a wrong code.
            let record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Failure)
                .with_actor(pending.identity_id)
                .with_ip(ip)
                .with_detail("code_already_used");
            ledger.append_best_effort(&record).await;
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
        ConsumeOutcome::Invalid => {
            let record = NewAuditRecord::global(&pending.email, "auth.login", Outcome::Failure)
                .with_actor(pending.identity_id)
                .with_ip(ip)
                .with_detail("code_invalid");
            ledger.append_best_effort(&record).await;
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let token = match insert_session(
        &pool,
        pending.identity_id,
        auth_state.config.session_ttl,
        true,
    )
    .await
    {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue session: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = session_cookie(&auth_state.config, &token) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (
        StatusCode::OK,
        response_headers,
        Json(SessionResponse { token }),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/mfa/backup-codes/regenerate",
    responses(
        (status = 200, description = "New batch issued, previous codes void", body = BackupCodesResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden")
    ),
    tag = "mfa"
)]
pub async fn regenerate_backup_codes(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let principal = match require_mfa(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };
    if principal.role != Role::Sysadmin {
        return StatusCode::FORBIDDEN.into_response();
    }

    let record = NewAuditRecord::global(
        &principal.email,
        "auth.backup_codes_regenerated",
        Outcome::Success,
    )
    .with_actor(principal.identity_id)
    .with_ip(extract_client_ip(&headers));
    let codes = match storage::regenerate(
        &pool,
        &auth_state.config.backup_code_pepper,
        principal.identity_id,
        &record,
    )
    .await
    {
        Ok(codes) => codes,
        Err(err) => {
            error!("Failed to regenerate backup codes: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    (
        StatusCode::OK,
        Json(BackupCodesResponse {
            backup_codes: codes,
        }),
    )
        .into_response()
}

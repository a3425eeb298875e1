//! Password stage of login, and logout.
//!
//! Login never issues an MFA-verified session by itself. A correct
//! password leads to one of two continuations: a setup session when the
//! identity has no passkey yet, or a passkey challenge bound to a
//! single-use pending login. Unknown emails, inactive identities, and
//! wrong passwords all produce the same response after the same amount
//! of hashing work.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header::SET_COOKIE},
    response::IntoResponse,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use super::principal::{clear_session_cookie, extract_session_token, require_auth};
use super::state::{AuthState, PendingLogin};
use super::storage::{delete_session, identity_by_email, insert_session};
use super::types::{LoginRequest, LoginResponse};
use super::utils::{extract_client_ip, normalize_email, verify_dummy_password, verify_password};
use crate::audit::{AuditLedger, NewAuditRecord, Outcome, PgLedger};
use crate::webauthn::{PasskeyRepo, deserialize_credential};

#[utoipa::path(
    post,
    path = "/v1/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Password accepted, second factor required", body = LoginResponse),
        (status = 401, description = "Unauthorized")
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    auth_state: Extension<Arc<AuthState>>,
    Json(body): Json<LoginRequest>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    let ip = extract_client_ip(&headers);

    let identity = match identity_by_email(&pool, &email).await {
        Ok(identity) => identity,
        Err(err) => {
            error!("Failed to look up identity: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some(identity) = identity.filter(|identity| identity.active) else {
        // Same hashing cost as the known-email path.
        verify_dummy_password(&body.password);
        return login_failure(&ledger, &email, ip).await;
    };

    let password_ok = match verify_password(&body.password, &identity.password_hash) {
        Ok(ok) => ok,
        Err(err) => {
            error!("Failed to verify password: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if !password_ok {
        return login_failure(&ledger, &email, ip).await;
    }

    let passkeys = match PasskeyRepo::list_for_identity(&pool, identity.id).await {
        Ok(passkeys) => passkeys,
        Err(err) => {
            error!("Failed to load passkeys: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if passkeys.is_empty() {
        // No second factor registered yet: issue a short-lived setup
        // session that can only reach the passkey-setup endpoints.
        let setup_token = match insert_session(
            &pool,
            identity.id,
            auth_state.config.setup_session_ttl,
            false,
        )
        .await
        {
            Ok(token) => token,
            Err(err) => {
                error!("Failed to issue setup session: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let record = NewAuditRecord::global(&identity.email, "auth.login", Outcome::Success)
            .with_actor(identity.id)
            .with_ip(ip)
            .with_detail("mfa_setup_required");
        if let Err(err) = ledger.append(&record).await {
            error!("Failed to append audit record: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        return (StatusCode::OK, Json(LoginResponse::SetupRequired { setup_token }))
            .into_response();
    }

    let mut credentials = Vec::with_capacity(passkeys.len());
    for passkey in &passkeys {
        match deserialize_credential(&passkey.passkey_data) {
            Ok(credential) => credentials.push(credential),
            Err(err) => {
                error!("Failed to deserialize stored passkey: {err}");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    let (auth_id, challenge) = match auth_state
        .ceremony
        .assert_begin(identity.id, &credentials)
        .await
    {
        Ok(pair) => pair,
        Err(err) => {
            error!("Failed to start passkey assertion: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let login_id = auth_state
        .store_pending_login(PendingLogin {
            identity_id: identity.id,
            email: identity.email,
            role: identity.role,
            auth_id: Some(auth_id),
            ip,
            created_at: Instant::now(),
        })
        .await;

    (
        StatusCode::OK,
        Json(LoginResponse::PasskeyRequired { login_id, challenge }),
    )
        .into_response()
}

async fn login_failure(
    ledger: &PgLedger,
    email: &str,
    ip: Option<String>,
) -> axum::response::Response {
    let record =
        NewAuditRecord::global(email, "auth.login", Outcome::Failure).with_ip(ip);
    if let Err(err) = ledger.append(&record).await {
        error!("Failed to append audit record: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[utoipa::path(
    post,
    path = "/v1/logout",
    responses(
        (status = 204, description = "Session cleared")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    if let Ok(principal) = require_auth(&headers, &pool).await {
        match delete_session(&pool, &principal.token).await {
            Ok(true) => {
                let record =
                    NewAuditRecord::global(&principal.email, "auth.logout", Outcome::Success)
                        .with_actor(principal.identity_id)
                        .with_ip(extract_client_ip(&headers));
                ledger.append_best_effort(&record).await;
            }
            Ok(false) => {}
            Err(err) => error!("Failed to delete session: {err}"),
        }
    } else if let Some(token) = extract_session_token(&headers) {
        // Expired or unknown token: still drop any row it maps to.
        if let Err(err) = delete_session(&pool, &token).await {
            error!("Failed to delete session: {err}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = HeaderMap::new();
    if let Ok(cookie) = clear_session_cookie(&auth_state.config) {
        response_headers.insert(SET_COOKIE, cookie);
    }
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

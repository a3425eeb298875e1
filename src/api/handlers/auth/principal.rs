//! Session extraction and the authenticated principal.
//!
//! Handlers accept the session token either as a bearer header (API
//! clients) or the session cookie (the browser frontend). A session with
//! `mfa_verified = false` is a setup session: it may only reach the
//! passkey-setup endpoints, which is enforced by the two guard levels
//! here.

use super::state::AuthConfig;
use super::storage::{SessionRecord, lookup_session};
use crate::authz::Role;
use axum::http::header::{AUTHORIZATION, COOKIE, InvalidHeaderValue};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

pub(crate) const SESSION_COOKIE_NAME: &str = "zorgi_session";

/// The identity behind a valid session.
pub struct Principal {
    pub identity_id: Uuid,
    pub email: String,
    pub role: Role,
    pub mfa_verified: bool,
    pub token: String,
}

/// Resolve the request's session into a principal. Setup sessions pass;
/// use [`require_mfa`] where a verified second factor is required.
///
/// # Errors
/// Returns 401 when no valid session is presented, 500 on lookup failure.
pub(crate) async fn require_auth(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Principal, StatusCode> {
    let Some(token) = extract_session_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    match lookup_session(pool, &token).await {
        Ok(Some(SessionRecord {
            identity_id,
            email,
            role,
            mfa_verified,
        })) => Ok(Principal {
            identity_id,
            email,
            role,
            mfa_verified,
            token,
        }),
        Ok(None) => Err(StatusCode::UNAUTHORIZED),
        Err(err) => {
            error!("Failed to lookup session: {err}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Like [`require_auth`], but rejects setup sessions.
///
/// # Errors
/// Returns 401 when the session is missing or not MFA-verified.
pub(crate) async fn require_mfa(
    headers: &HeaderMap,
    pool: &PgPool,
) -> Result<Principal, StatusCode> {
    let principal = require_auth(headers, pool).await?;
    if !principal.mfa_verified {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(principal)
}

/// Build a secure `HttpOnly` cookie carrying the session token.
pub(super) fn session_cookie(
    config: &AuthConfig,
    token: &str,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let ttl_seconds = config.session_ttl.as_secs();
    let mut cookie = format!(
        "{SESSION_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl_seconds}"
    );
    if config.session_cookie_secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(super) fn clear_session_cookie(config: &AuthConfig) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    if config.session_cookie_secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub(crate) fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == SESSION_COOKIE_NAME {
            return Some(val.to_string());
        }
    }
    None
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn config() -> AuthConfig {
        AuthConfig::new("https://care.example.com", SecretString::from("pepper")).unwrap()
    }

    #[test]
    fn bearer_token_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer from-header".parse().unwrap());
        headers.insert(
            COOKIE,
            format!("{SESSION_COOKIE_NAME}=from-cookie").parse().unwrap(),
        );
        assert_eq!(
            extract_session_token(&headers).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn cookie_token_is_found_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("theme=dark; {SESSION_COOKIE_NAME}=abc; lang=nl")
                .parse()
                .unwrap(),
        );
        assert_eq!(extract_session_token(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn empty_bearer_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(extract_session_token(&headers), None);
    }

    #[test]
    fn session_cookie_sets_secure_for_https() {
        let cookie = session_cookie(&config(), "tok").unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.contains("zorgi_session=tok"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
    }

    #[test]
    fn clear_cookie_expires_immediately() {
        let cookie = clear_session_cookie(&config()).unwrap();
        let value = cookie.to_str().unwrap();
        assert!(value.contains("Max-Age=0"));
    }
}

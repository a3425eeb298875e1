//! Database access for identities, sessions, and one-time tokens.
//!
//! Tokens never touch the database in raw form: sessions and one-time
//! tokens are stored as SHA-256 digests, and lookups hash the presented
//! value before comparing. Session issuance retries on the (vanishingly
//! unlikely) digest collision instead of failing the login.

use super::types::HomeSummary;
use super::utils::{generate_token, hash_token, is_unique_violation};
use crate::authz::Role;
use anyhow::{Context, Result, anyhow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{Instrument, info_span};
use uuid::Uuid;

const TOKEN_INSERT_RETRIES: usize = 3;

/// One-time token purposes, matching the `one_time_tokens.purpose` check
/// constraint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenPurpose {
    PasswordReset,
    Invitation,
}

impl TokenPurpose {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PasswordReset => "password_reset",
            Self::Invitation => "invitation",
        }
    }
}

#[derive(Debug)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub mfa_setup_complete: bool,
    pub active: bool,
}

#[derive(Debug)]
pub struct SessionRecord {
    pub identity_id: Uuid,
    pub email: String,
    pub role: Role,
    pub mfa_verified: bool,
}

/// Look up an identity by (normalized) email.
///
/// # Errors
/// Returns error if the query fails or the stored role is unknown.
pub async fn identity_by_email(pool: &PgPool, email: &str) -> Result<Option<IdentityRecord>> {
    let query = r"
        SELECT id, email, password_hash, role, mfa_setup_complete, active
        FROM identities
        WHERE email = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up identity")?;

    row.map(|row| {
        let role: String = row.get("role");
        Ok(IdentityRecord {
            id: row.get("id"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            role: Role::from_str(&role)?,
            mfa_setup_complete: row.get("mfa_setup_complete"),
            active: row.get("active"),
        })
    })
    .transpose()
}

/// Issue a session and return the raw token. Only the digest is stored.
///
/// # Errors
/// Returns error if the insert keeps colliding or the query fails.
pub async fn insert_session(
    pool: &PgPool,
    identity_id: Uuid,
    ttl: Duration,
    mfa_verified: bool,
) -> Result<String> {
    let query = r"
        INSERT INTO sessions (identity_id, session_hash, mfa_verified, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
    ";
    let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

    for _ in 0..TOKEN_INSERT_RETRIES {
        let token = generate_token();
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(identity_id)
            .bind(hash_token(&token))
            .bind(mfa_verified)
            .bind(ttl_seconds)
            .execute(pool)
            .instrument(span)
            .await;

        match result {
            Ok(_) => return Ok(token),
            Err(err) if is_unique_violation(&err) => continue,
            Err(err) => return Err(err).context("failed to insert session"),
        }
    }

    Err(anyhow!("session token generation kept colliding"))
}

/// Resolve a raw session token to an active identity, touching
/// `last_seen_at` on the way. Expired sessions and inactive identities
/// resolve to `None`.
///
/// # Errors
/// Returns error if the query fails or the stored role is unknown.
pub async fn lookup_session(pool: &PgPool, token: &str) -> Result<Option<SessionRecord>> {
    let query = r"
        UPDATE sessions s
        SET last_seen_at = NOW()
        FROM identities i
        WHERE s.session_hash = $1
          AND s.expires_at > NOW()
          AND i.id = s.identity_id
          AND i.active
        RETURNING i.id AS identity_id, i.email, i.role, s.mfa_verified
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(hash_token(token))
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to look up session")?;

    row.map(|row| {
        let role: String = row.get("role");
        Ok(SessionRecord {
            identity_id: row.get("identity_id"),
            email: row.get("email"),
            role: Role::from_str(&role)?,
            mfa_verified: row.get("mfa_verified"),
        })
    })
    .transpose()
}

/// Delete the session behind a raw token. Returns whether a row existed.
///
/// # Errors
/// Returns error if the query fails.
pub async fn delete_session(pool: &PgPool, token: &str) -> Result<bool> {
    let query = "DELETE FROM sessions WHERE session_hash = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(hash_token(token))
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to delete session")?;
    Ok(result.rows_affected() > 0)
}

/// Revoke every session for an identity, inside the caller's transaction
/// (used by password reset so revocation commits with the new hash).
///
/// # Errors
/// Returns error if the query fails.
pub async fn delete_sessions_for_identity(
    tx: &mut Transaction<'_, Postgres>,
    identity_id: Uuid,
) -> Result<u64> {
    let query = "DELETE FROM sessions WHERE identity_id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(identity_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to revoke sessions")?;
    Ok(result.rows_affected())
}

/// Issue a one-time token inside the caller's transaction and return the
/// raw value for the email link.
///
/// # Errors
/// Returns error if the insert keeps colliding or the query fails.
pub async fn insert_one_time_token(
    tx: &mut Transaction<'_, Postgres>,
    identity_id: Uuid,
    purpose: TokenPurpose,
    ttl: Duration,
) -> Result<String> {
    let query = r"
        INSERT INTO one_time_tokens (identity_id, token_hash, purpose, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
    ";
    let ttl_seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

    for _ in 0..TOKEN_INSERT_RETRIES {
        let token = generate_token();
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(identity_id)
            .bind(hash_token(&token))
            .bind(purpose.as_str())
            .bind(ttl_seconds)
            .execute(&mut **tx)
            .instrument(span)
            .await;

        match result {
            Ok(_) => return Ok(token),
            Err(err) if is_unique_violation(&err) => continue,
            Err(err) => return Err(err).context("failed to insert one-time token"),
        }
    }

    Err(anyhow!("one-time token generation kept colliding"))
}

/// Consume a one-time token: marks it used and returns the identity it
/// belongs to. Expired, already-consumed, or wrong-purpose tokens return
/// `None`. Runs in the caller's transaction so the consumption commits
/// with the state change it authorizes.
///
/// # Errors
/// Returns error if the query fails.
pub async fn consume_one_time_token(
    tx: &mut Transaction<'_, Postgres>,
    token: &str,
    purpose: TokenPurpose,
) -> Result<Option<Uuid>> {
    let query = r"
        UPDATE one_time_tokens
        SET consumed_at = NOW()
        WHERE token_hash = $1
          AND purpose = $2
          AND consumed_at IS NULL
          AND expires_at > NOW()
        RETURNING identity_id
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(hash_token(token))
        .bind(purpose.as_str())
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to consume one-time token")?;
    Ok(row.map(|row| row.get("identity_id")))
}

/// Email for an identity id, inside the caller's transaction.
///
/// # Errors
/// Returns error if the query fails.
pub async fn identity_email(
    tx: &mut Transaction<'_, Postgres>,
    identity_id: Uuid,
) -> Result<Option<String>> {
    let query = "SELECT email FROM identities WHERE id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(identity_id)
        .fetch_optional(&mut **tx)
        .instrument(span)
        .await
        .context("failed to load identity email")?;
    Ok(row.map(|row| row.get("email")))
}

/// Replace an identity's password hash inside the caller's transaction.
///
/// # Errors
/// Returns error if the query fails.
pub async fn update_password(
    tx: &mut Transaction<'_, Postgres>,
    identity_id: Uuid,
    password_hash: &str,
) -> Result<()> {
    let query = r"
        UPDATE identities
        SET password_hash = $2, updated_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(identity_id)
        .bind(password_hash)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to update password")?;
    Ok(())
}

/// Activate an invited identity inside the caller's transaction.
///
/// # Errors
/// Returns error if the query fails.
pub async fn activate_identity(
    tx: &mut Transaction<'_, Postgres>,
    identity_id: Uuid,
) -> Result<()> {
    let query = r"
        UPDATE identities
        SET active = TRUE, updated_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(identity_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to activate identity")?;
    Ok(())
}

/// Mark MFA setup complete after the first passkey registration.
///
/// # Errors
/// Returns error if the query fails.
pub async fn set_mfa_setup_complete(pool: &PgPool, identity_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE identities
        SET mfa_setup_complete = TRUE, updated_at = NOW()
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(identity_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to mark MFA setup complete")?;
    Ok(())
}

/// Homes an identity is actively assigned to.
///
/// # Errors
/// Returns error if the query fails.
pub async fn home_assignments_for(pool: &PgPool, identity_id: Uuid) -> Result<Vec<HomeSummary>> {
    let query = r"
        SELECT h.id, h.name
        FROM home_assignments a
        JOIN homes h ON h.id = a.home_id
        WHERE a.identity_id = $1
          AND a.active
        ORDER BY h.name
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(identity_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load home assignments")?;

    Ok(rows
        .into_iter()
        .map(|row| HomeSummary {
            id: row.get("id"),
            name: row.get("name"),
        })
        .collect())
}

/// The home a client record belongs to, for scoping decisions on
/// client-rooted resources.
///
/// # Errors
/// Returns error if the query fails.
pub async fn client_home(pool: &PgPool, client_id: Uuid) -> Result<Option<Uuid>> {
    let query = "SELECT home_id FROM clients WHERE id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(client_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to resolve client home")?;
    Ok(row.map(|row| row.get("home_id")))
}

#[cfg(test)]
mod tests {
    use super::TokenPurpose;

    #[test]
    fn token_purpose_labels_match_schema() {
        assert_eq!(TokenPurpose::PasswordReset.as_str(), "password_reset");
        assert_eq!(TokenPurpose::Invitation.as_str(), "invitation");
    }
}

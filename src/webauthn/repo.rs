use crate::webauthn::models::PasskeyRow;
use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::Instrument;
use uuid::Uuid;

pub struct PasskeyRepo;

impl PasskeyRepo {
    /// Stores a newly registered credential with its initial counter.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn create(
        pool: &PgPool,
        identity_id: Uuid,
        credential_id: &[u8],
        passkey_data: &[u8],
        sign_count: i64,
        label: Option<&str>,
    ) -> Result<()> {
        let query = r"
            INSERT INTO passkeys (identity_id, credential_id, passkey_data, sign_count, label)
            VALUES ($1, $2, $3, $4, $5)
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .bind(credential_id)
            .bind(passkey_data)
            .bind(sign_count)
            .bind(label)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to insert passkey")?;
        Ok(())
    }

    /// Lists all credentials registered for an identity.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn list_for_identity(pool: &PgPool, identity_id: Uuid) -> Result<Vec<PasskeyRow>> {
        sqlx::query_as::<_, PasskeyRow>(
            "SELECT * FROM passkeys WHERE identity_id = $1 ORDER BY created_at DESC",
        )
        .bind(identity_id)
        .fetch_all(pool)
        .await
        .context("failed to list passkeys")
    }

    /// Fetches a credential by its credential id.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn get_by_credential(
        pool: &PgPool,
        credential_id: &[u8],
    ) -> Result<Option<PasskeyRow>> {
        sqlx::query_as::<_, PasskeyRow>("SELECT * FROM passkeys WHERE credential_id = $1")
            .bind(credential_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch passkey")
    }

    /// Marks a credential used without touching its counter, for
    /// authenticators that report a counter of zero (no counter support).
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn touch(pool: &PgPool, credential_id: &[u8]) -> Result<()> {
        let query = "UPDATE passkeys SET last_used_at = NOW() WHERE credential_id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(credential_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to touch passkey")?;
        Ok(())
    }

    /// Records a successful assertion, advancing the signature counter.
    ///
    /// The update only matches when the new counter is strictly greater
    /// than the stored one, so the non-decreasing invariant holds even
    /// under concurrent assertions. Returns `false` when the counter did
    /// not advance; callers treat that as a possible cloned credential.
    ///
    /// # Errors
    /// Returns error if the database query fails.
    pub async fn record_assertion(
        pool: &PgPool,
        credential_id: &[u8],
        new_sign_count: i64,
    ) -> Result<bool> {
        let query = r"
            UPDATE passkeys
            SET sign_count = $1, last_used_at = NOW()
            WHERE credential_id = $2
              AND sign_count < $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(new_sign_count)
            .bind(credential_id)
            .execute(pool)
            .instrument(span)
            .await
            .context("failed to record passkey assertion")?;
        Ok(result.rows_affected() > 0)
    }
}

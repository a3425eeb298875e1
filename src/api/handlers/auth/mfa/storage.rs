//! Persistence for backup codes.
//!
//! Consumption serializes on row locks: the identity's code rows are
//! taken `FOR UPDATE`, so two concurrent submissions of the same code
//! cannot both match the unused row, regardless of how many replicas of
//! the service are running.

use super::recovery::{BackupCodeBatch, verify_code};
use crate::audit::{NewAuditRecord, PgLedger};
use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Instrument, info_span};
use uuid::Uuid;

/// Result of trying to redeem a backup code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    /// The code matched a row that has already been redeemed.
    AlreadyUsed,
    /// The code matched nothing.
    Invalid,
}

/// Store a freshly generated batch inside the caller's transaction.
///
/// # Errors
/// Returns error if an insert fails.
pub async fn insert_batch(
    tx: &mut Transaction<'_, Postgres>,
    identity_id: Uuid,
    batch: &BackupCodeBatch,
) -> Result<()> {
    let query = r"
        INSERT INTO backup_codes (identity_id, batch_id, code_hash)
        VALUES ($1, $2, $3)
    ";
    for hash in &batch.hashes {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(identity_id)
            .bind(batch.batch_id)
            .bind(hash)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to insert backup code")?;
    }
    Ok(())
}

/// Redeem a backup code. On a match the used-marker and the success
/// audit record commit in the same transaction; concurrent submissions
/// of the same code serialize on the row locks and the loser sees
/// `AlreadyUsed`.
///
/// # Errors
/// Returns error if a query, hash verification, or the commit fails.
pub async fn consume_code(
    pool: &PgPool,
    pepper: &SecretString,
    identity_id: Uuid,
    code: &str,
    success_record: &NewAuditRecord,
) -> Result<ConsumeOutcome> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start backup code transaction")?;

    let query = r"
        SELECT id, code_hash, used_at
        FROM backup_codes
        WHERE identity_id = $1
        ORDER BY created_at
        FOR UPDATE
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(identity_id)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lock backup codes")?;

    let mut matched: Option<(Uuid, bool)> = None;
    for row in &rows {
        let hash: String = row.get("code_hash");
        if verify_code(pepper, code, &hash)? {
            let used: Option<chrono::DateTime<chrono::Utc>> = row.get("used_at");
            matched = Some((row.get("id"), used.is_some()));
            break;
        }
    }

    let outcome = match matched {
        None => ConsumeOutcome::Invalid,
        Some((_, true)) => ConsumeOutcome::AlreadyUsed,
        Some((code_id, false)) => {
            let update = "UPDATE backup_codes SET used_at = NOW() WHERE id = $1";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = update
            );
            sqlx::query(update)
                .bind(code_id)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to mark backup code used")?;
            PgLedger::append_in_tx(&mut tx, success_record).await?;
            ConsumeOutcome::Consumed
        }
    };

    tx.commit()
        .await
        .context("failed to commit backup code transaction")?;
    Ok(outcome)
}

/// Replace the identity's batch: old codes are deleted, new ones
/// inserted, and the audit record appended, all in one transaction.
/// Returns the plaintext codes for their single appearance.
///
/// # Errors
/// Returns error if generation or any query fails.
pub async fn regenerate(
    pool: &PgPool,
    pepper: &SecretString,
    identity_id: Uuid,
    audit_record: &NewAuditRecord,
) -> Result<Vec<String>> {
    let batch = BackupCodeBatch::generate(pepper)?;

    let mut tx = pool
        .begin()
        .await
        .context("failed to start regenerate transaction")?;

    let delete = "DELETE FROM backup_codes WHERE identity_id = $1";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = delete
    );
    sqlx::query(delete)
        .bind(identity_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete previous backup codes")?;

    insert_batch(&mut tx, identity_id, &batch).await?;
    PgLedger::append_in_tx(&mut tx, audit_record).await?;

    tx.commit()
        .await
        .context("failed to commit regenerate transaction")?;

    Ok(batch.codes)
}

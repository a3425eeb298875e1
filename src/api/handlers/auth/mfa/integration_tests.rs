//! Database-backed tests for backup code consumption.
//!
//! The single-use property has to hold under concurrency, so these run
//! against a throwaway schema; they skip when `ZORGI_TEST_DSN` is unset.

use super::super::state::PendingLogin;
use super::super::test_support::{seed_identity, test_pool, test_state};
use super::super::types::VerifyBackupCodeRequest;
use super::recovery::BackupCodeBatch;
use super::storage::{ConsumeOutcome, consume_code, insert_batch, regenerate};
use super::verify_backup_code;
use crate::audit::{NewAuditRecord, Outcome, PgLedger};
use crate::authz::Role;
use anyhow::Result;
use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use secrecy::SecretString;
use sqlx::PgPool;
use std::time::Instant;
use uuid::Uuid;

fn pepper() -> SecretString {
    SecretString::from("test-pepper")
}

fn success_record(email: &str, identity_id: Uuid) -> NewAuditRecord {
    NewAuditRecord::global(email, "auth.login", Outcome::Success).with_actor(identity_id)
}

async fn seed_batch(pool: &PgPool, identity_id: Uuid) -> Result<BackupCodeBatch> {
    let batch = BackupCodeBatch::generate(&pepper())?;
    let mut tx = pool.begin().await?;
    insert_batch(&mut tx, identity_id, &batch).await?;
    tx.commit().await?;
    Ok(batch)
}

#[tokio::test]
async fn concurrent_consumption_accepts_one() -> Result<()> {
    let Some(pool) = test_pool().await? else {
        return Ok(());
    };
    let identity_id =
        seed_identity(&pool, "root@zorgi.care", "a password", Role::Sysadmin, true).await?;
    let batch = seed_batch(&pool, identity_id).await?;

    let code = batch.codes[0].as_str();
    let record = success_record("root@zorgi.care", identity_id);
    let pepper = pepper();
    let (first, second, third) = tokio::join!(
        consume_code(&pool, &pepper, identity_id, code, &record),
        consume_code(&pool, &pepper, identity_id, code, &record),
        consume_code(&pool, &pepper, identity_id, code, &record),
    );

    let outcomes = [first?, second?, third?];
    let consumed = outcomes
        .iter()
        .filter(|outcome| **outcome == ConsumeOutcome::Consumed)
        .count();
    assert_eq!(consumed, 1, "a code must be consumable exactly once");
    assert!(
        outcomes
            .iter()
            .all(|outcome| *outcome != ConsumeOutcome::Invalid),
        "the losing calls see the code as spent, not unknown"
    );
    Ok(())
}

#[tokio::test]
async fn regeneration_voids_previous_batch() -> Result<()> {
    let Some(pool) = test_pool().await? else {
        return Ok(());
    };
    let identity_id =
        seed_identity(&pool, "root@zorgi.care", "a password", Role::Sysadmin, true).await?;

    let record = NewAuditRecord::global("root@zorgi.care", "auth.backup_codes.regenerate", Outcome::Success)
        .with_actor(identity_id);
    let old_codes = regenerate(&pool, &pepper(), identity_id, &record).await?;
    let new_codes = regenerate(&pool, &pepper(), identity_id, &record).await?;

    let login = success_record("root@zorgi.care", identity_id);
    assert_eq!(
        consume_code(&pool, &pepper(), identity_id, &old_codes[0], &login).await?,
        ConsumeOutcome::Invalid,
        "codes from a replaced batch must stop working"
    );
    assert_eq!(
        consume_code(&pool, &pepper(), identity_id, &new_codes[0], &login).await?,
        ConsumeOutcome::Consumed
    );
    Ok(())
}

#[tokio::test]
async fn used_code_keeps_generic_response() -> Result<()> {
    let Some(pool) = test_pool().await? else {
        return Ok(());
    };
    let identity_id =
        seed_identity(&pool, "root@zorgi.care", "a password", Role::Sysadmin, true).await?;
    let batch = seed_batch(&pool, identity_id).await?;

    // Spend the code once, then replay it through the handler.
    let login = success_record("root@zorgi.care", identity_id);
    assert_eq!(
        consume_code(&pool, &pepper(), identity_id, &batch.codes[0], &login).await?,
        ConsumeOutcome::Consumed
    );

    let state = test_state()?;
    let login_id = state
        .store_pending_login(PendingLogin {
            identity_id,
            email: "root@zorgi.care".to_string(),
            role: Role::Sysadmin,
            auth_id: None,
            ip: None,
            created_at: Instant::now(),
        })
        .await;

    let response = verify_backup_code(
        HeaderMap::new(),
        Extension(pool.clone()),
        Extension(PgLedger::new(pool.clone())),
        Extension(state),
        Json(VerifyBackupCodeRequest {
            login_id,
            code: SecretString::from(batch.codes[0].clone()),
        }),
    )
    .await
    .into_response();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    // The reply must not reveal that the code was once valid.
    assert_eq!(&body[..], b"Unauthorized");
    Ok(())
}

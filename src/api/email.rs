//! Notifier contract and transactional email outbox.
//!
//! Flows that need to reach staff by email (password reset, invitations)
//! enqueue a row in `email_outbox` inside the transaction of the state
//! change that triggered it. A background task polls the table, locks a
//! batch via `FOR UPDATE SKIP LOCKED`, and hands each row to a
//! [`Notifier`]. Delivery failure never blocks an auth state transition:
//! rows are retried with exponential backoff and jitter, then marked
//! `failed` and left for operators ("logged, not sent").
//!
//! The default notifier for local dev is [`LogNotifier`], which logs the
//! message and reports success.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Delivery abstraction for the external notifier.
pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev notifier that logs instead of sending.
#[derive(Clone, Debug)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            subject = %message.subject,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OutboxWorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl OutboxWorkerConfig {
    /// 5s poll, 10 rows per batch, 5 attempts, 5s->5m backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    /// Clamp zero or inverted settings to the smallest sane values so a
    /// misconfigured worker still makes progress.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_secs(1);
        }
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        self.max_attempts = self.max_attempts.max(1);
        if self.backoff_base.is_zero() {
            self.backoff_base = Duration::from_secs(1);
        }
        self.backoff_max = self.backoff_max.max(self.backoff_base);
        self
    }
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    to_email: String,
    subject: String,
    html_body: String,
    text_body: String,
    attempts: i32,
}

impl OutboxRow {
    fn message(&self) -> EmailMessage {
        EmailMessage {
            to_email: self.to_email.clone(),
            subject: self.subject.clone(),
            html_body: self.html_body.clone(),
            text_body: self.text_body.clone(),
        }
    }
}

type PgTx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Enqueue a message inside the caller's transaction, so the email row
/// commits, or rolls back, with the state change it belongs to.
pub(crate) async fn enqueue_email(tx: &mut PgTx<'_>, message: &EmailMessage) -> Result<()> {
    let query = r"
        INSERT INTO email_outbox (to_email, subject, html_body, text_body)
        VALUES ($1, $2, $3, $4)
    ";
    sqlx::query(query)
        .bind(&message.to_email)
        .bind(&message.subject)
        .bind(&message.html_body)
        .bind(&message.text_body)
        .execute(&mut **tx)
        .instrument(query_span("INSERT", query))
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}

/// Spawn a background task that polls and processes the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    notifier: Arc<dyn Notifier>,
    config: OutboxWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.clamped();

        loop {
            if let Err(err) = process_outbox_batch(&pool, notifier.as_ref(), &config).await {
                error!("email outbox batch failed: {err}");
            }

            sleep(config.poll_interval).await;
        }
    })
}

async fn process_outbox_batch(
    pool: &PgPool,
    notifier: &dyn Notifier,
    config: &OutboxWorkerConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start email outbox transaction")?;

    // Locked batch so multiple workers can run without double-sending.
    let query = r"
        SELECT id, to_email, subject, html_body, text_body, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let rows: Vec<OutboxRow> = sqlx::query_as(query)
        .bind(i64::try_from(config.batch_size).unwrap_or(0))
        .fetch_all(&mut *tx)
        .instrument(query_span("SELECT", query))
        .await
        .context("failed to load email outbox batch")?;

    let row_count = rows.len();
    for row in &rows {
        let attempt = u32::try_from(row.attempts).unwrap_or(0).saturating_add(1);
        match notifier.send(&row.message()) {
            Ok(()) => mark_sent(&mut tx, row.id, attempt).await?,
            Err(err) if attempt >= config.max_attempts => {
                mark_failed(&mut tx, row.id, attempt, &err).await?;
            }
            Err(err) => schedule_retry(&mut tx, row.id, attempt, &err, config).await?,
        }
    }

    tx.commit()
        .await
        .context("failed to commit email outbox batch")?;

    Ok(row_count)
}

async fn mark_sent(tx: &mut PgTx<'_>, id: Uuid, attempt: u32) -> Result<()> {
    let query = r"
        UPDATE email_outbox
        SET status = 'sent',
            attempts = $2,
            last_error = NULL,
            sent_at = NOW(),
            next_attempt_at = NOW()
        WHERE id = $1
    ";
    sqlx::query(query)
        .bind(id)
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .execute(&mut **tx)
        .instrument(query_span("UPDATE", query))
        .await
        .context("failed to update outbox status to sent")?;
    Ok(())
}

async fn mark_failed(tx: &mut PgTx<'_>, id: Uuid, attempt: u32, err: &anyhow::Error) -> Result<()> {
    let query = r"
        UPDATE email_outbox
        SET status = 'failed',
            attempts = $2,
            last_error = $3,
            next_attempt_at = NOW()
        WHERE id = $1
    ";
    sqlx::query(query)
        .bind(id)
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(err.to_string())
        .execute(&mut **tx)
        .instrument(query_span("UPDATE", query))
        .await
        .context("failed to update outbox status to failed")?;
    Ok(())
}

async fn schedule_retry(
    tx: &mut PgTx<'_>,
    id: Uuid,
    attempt: u32,
    err: &anyhow::Error,
    config: &OutboxWorkerConfig,
) -> Result<()> {
    let delay = retry_delay(attempt, config);
    let query = r"
        UPDATE email_outbox
        SET status = 'pending',
            attempts = $2,
            last_error = $3,
            next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
        WHERE id = $1
    ";
    sqlx::query(query)
        .bind(id)
        .bind(i32::try_from(attempt).unwrap_or(i32::MAX))
        .bind(err.to_string())
        .bind(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
        .execute(&mut **tx)
        .instrument(query_span("UPDATE", query))
        .await
        .context("failed to update outbox retry schedule")?;
    Ok(())
}

/// Exponential backoff for the given attempt number (1-based), capped at
/// `backoff_max`, with jitter in `[delay/2, delay]`.
fn retry_delay(attempt: u32, config: &OutboxWorkerConfig) -> Duration {
    let doublings = attempt.saturating_sub(1).min(31);
    let delay = config
        .backoff_base
        .checked_mul(1u32 << doublings)
        .map_or(config.backoff_max, |d| d.min(config.backoff_max));

    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
}

#[cfg(test)]
mod tests {
    use super::{EmailMessage, LogNotifier, Notifier, OutboxWorkerConfig, retry_delay};
    use std::time::Duration;

    #[test]
    fn log_notifier_reports_success() {
        let message = EmailMessage {
            to_email: "staff@example.com".to_string(),
            subject: "Reset your password".to_string(),
            html_body: "<p>link</p>".to_string(),
            text_body: "link".to_string(),
        };
        assert!(LogNotifier.send(&message).is_ok());
    }

    #[test]
    fn clamped_fixes_zero_values() {
        let mut config = OutboxWorkerConfig::new();
        config.poll_interval = Duration::ZERO;
        config.batch_size = 0;
        config.max_attempts = 0;
        config.backoff_max = Duration::ZERO;

        let config = config.clamped();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 1);
        assert!(config.backoff_max >= config.backoff_base);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let mut config = OutboxWorkerConfig::new();
        config.backoff_base = Duration::from_secs(4);
        config.backoff_max = Duration::from_secs(60);

        let first = retry_delay(1, &config);
        let late = retry_delay(10, &config);
        assert!(first >= Duration::from_secs(2));
        assert!(first <= Duration::from_secs(4));
        assert!(late >= Duration::from_secs(30));
        assert!(late <= Duration::from_secs(60));
    }
}

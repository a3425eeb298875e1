//! Audit record types and ledger implementations.
//!
//! Records are partitioned by home (or `global` for events outside a home
//! scope) and ordered by timestamp within a partition. For PHI-mutating
//! operations the append joins the mutation's transaction via
//! [`PgLedger::append_in_tx`], so the mutation cannot commit without its
//! record. For PHI reads, callers use [`AuditLedger::append_best_effort`]
//! which logs a failed append instead of blocking the read.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Instrument, error};
use uuid::Uuid;

/// Partition for events that are not tied to a home.
pub const GLOBAL_PARTITION: &str = "global";

/// Resolved outcome of the operation the record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Denied,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
        }
    }
}

/// A record to append. The actor email is snapshotted so ledger entries stay
/// meaningful after identity deletion.
#[derive(Clone, Debug)]
pub struct NewAuditRecord {
    pub partition: String,
    pub actor_id: Option<Uuid>,
    pub actor_email: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub outcome: Outcome,
    pub ip: Option<String>,
    pub detail: Option<String>,
}

impl NewAuditRecord {
    /// Record for an event outside any home scope.
    #[must_use]
    pub fn global(actor_email: &str, action: &str, outcome: Outcome) -> Self {
        Self {
            partition: GLOBAL_PARTITION.to_string(),
            actor_id: None,
            actor_email: actor_email.to_string(),
            action: action.to_string(),
            resource_type: "identity".to_string(),
            resource_id: None,
            outcome,
            ip: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    #[must_use]
    pub fn with_resource(mut self, resource_type: &str, resource_id: &str) -> Self {
        self.resource_type = resource_type.to_string();
        self.resource_id = Some(resource_id.to_string());
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition: &str) -> Self {
        self.partition = partition.to_string();
        self
    }

    #[must_use]
    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// A stored, immutable audit record.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    pub id: Uuid,
    pub partition: String,
    pub actor_id: Option<Uuid>,
    pub actor_email: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub outcome: String,
    pub ip: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger seam. Only create and read operations exist.
#[async_trait]
pub trait AuditLedger: Send + Sync {
    /// Append a record. Errors escalate to operation failure for PHI writes.
    async fn append(&self, record: &NewAuditRecord) -> Result<()>;

    /// Read recent records within a partition, newest first.
    async fn recent(&self, partition: &str, limit: i64) -> Result<Vec<AuditRecord>>;

    /// Append for a PHI read path: a failed append is logged, never raised.
    async fn append_best_effort(&self, record: &NewAuditRecord) {
        if let Err(err) = self.append(record).await {
            error!(
                action = %record.action,
                actor = %record.actor_email,
                outcome = record.outcome.as_str(),
                "audit append failed, record logged here as fallback: {err}"
            );
        }
    }
}

const INSERT_RECORD: &str = r"
    INSERT INTO audit_records
        (partition, actor_id, actor_email, action, resource_type, resource_id, outcome, ip, detail)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
";

/// Postgres-backed ledger. Issues INSERT and SELECT statements only.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append inside an open transaction so the record commits, or rolls
    /// back, together with the mutation it describes.
    pub async fn append_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &NewAuditRecord,
    ) -> Result<()> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = INSERT_RECORD
        );
        sqlx::query(INSERT_RECORD)
            .bind(&record.partition)
            .bind(record.actor_id)
            .bind(&record.actor_email)
            .bind(&record.action)
            .bind(&record.resource_type)
            .bind(&record.resource_id)
            .bind(record.outcome.as_str())
            .bind(&record.ip)
            .bind(&record.detail)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("failed to append audit record")?;
        Ok(())
    }
}

#[async_trait]
impl AuditLedger for PgLedger {
    async fn append(&self, record: &NewAuditRecord) -> Result<()> {
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = INSERT_RECORD
        );
        sqlx::query(INSERT_RECORD)
            .bind(&record.partition)
            .bind(record.actor_id)
            .bind(&record.actor_email)
            .bind(&record.action)
            .bind(&record.resource_type)
            .bind(&record.resource_id)
            .bind(record.outcome.as_str())
            .bind(&record.ip)
            .bind(&record.detail)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to append audit record")?;
        Ok(())
    }

    async fn recent(&self, partition: &str, limit: i64) -> Result<Vec<AuditRecord>> {
        let query = r"
            SELECT id, partition, actor_id, actor_email, action, resource_type,
                   resource_id, outcome, ip, detail, created_at
            FROM audit_records
            WHERE partition = $1
            ORDER BY created_at DESC
            LIMIT $2
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(partition)
            .bind(limit)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("failed to read audit records")?;

        Ok(rows
            .into_iter()
            .map(|row| AuditRecord {
                id: row.get("id"),
                partition: row.get("partition"),
                actor_id: row.get("actor_id"),
                actor_email: row.get("actor_email"),
                action: row.get("action"),
                resource_type: row.get("resource_type"),
                resource_id: row.get("resource_id"),
                outcome: row.get("outcome"),
                ip: row.get("ip"),
                detail: row.get("detail"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

/// In-memory ledger for tests and local tooling. Same interface discipline:
/// records can be appended and read, never touched again.
#[derive(Default)]
pub struct MemoryLedger {
    records: tokio::sync::Mutex<Vec<AuditRecord>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLedger for MemoryLedger {
    async fn append(&self, record: &NewAuditRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        records.push(AuditRecord {
            id: Uuid::new_v4(),
            partition: record.partition.clone(),
            actor_id: record.actor_id,
            actor_email: record.actor_email.clone(),
            action: record.action.clone(),
            resource_type: record.resource_type.clone(),
            resource_id: record.resource_id.clone(),
            outcome: record.outcome.as_str().to_string(),
            ip: record.ip.clone(),
            detail: record.detail.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent(&self, partition: &str, limit: i64) -> Result<Vec<AuditRecord>> {
        let records = self.records.lock().await;
        let mut matched: Vec<AuditRecord> = records
            .iter()
            .filter(|record| record.partition == partition)
            .cloned()
            .collect();
        matched.reverse();
        matched.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::{AuditLedger, MemoryLedger, NewAuditRecord, Outcome};
    use uuid::Uuid;

    #[test]
    fn outcome_labels() {
        assert_eq!(Outcome::Success.as_str(), "success");
        assert_eq!(Outcome::Failure.as_str(), "failure");
        assert_eq!(Outcome::Denied.as_str(), "denied");
    }

    #[test]
    fn record_builder_fills_fields() {
        let actor = Uuid::new_v4();
        let record = NewAuditRecord::global("carer@example.com", "phi.read", Outcome::Denied)
            .with_actor(actor)
            .with_resource("client", "abc")
            .with_partition("home-1")
            .with_ip(Some("10.0.0.1".to_string()))
            .with_detail("home_scope");

        assert_eq!(record.actor_id, Some(actor));
        assert_eq!(record.partition, "home-1");
        assert_eq!(record.resource_type, "client");
        assert_eq!(record.resource_id.as_deref(), Some("abc"));
        assert_eq!(record.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(record.detail.as_deref(), Some("home_scope"));
    }

    #[tokio::test]
    async fn memory_ledger_appends_and_reads_newest_first() -> anyhow::Result<()> {
        let ledger = MemoryLedger::new();
        ledger
            .append(&NewAuditRecord::global("a@example.com", "auth.login", Outcome::Failure))
            .await?;
        ledger
            .append(&NewAuditRecord::global("b@example.com", "auth.login", Outcome::Success))
            .await?;

        let records = ledger.recent("global", 10).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].actor_email, "b@example.com");
        assert_eq!(records[1].actor_email, "a@example.com");
        Ok(())
    }

    #[tokio::test]
    async fn ledger_interface_has_no_mutation_path() {
        // The trait surface is append + recent + append_best_effort; this
        // test documents the boundary by exercising everything there is.
        let ledger: &dyn AuditLedger = &MemoryLedger::new();
        ledger
            .append_best_effort(&NewAuditRecord::global(
                "a@example.com",
                "phi.read",
                Outcome::Success,
            ))
            .await;
        let records = ledger.recent("global", 1).await.unwrap_or_default();
        assert_eq!(records.len(), 1);
    }
}

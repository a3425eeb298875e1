use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row, postgres::PgRow};
use uuid::Uuid;

/// A stored passkey credential. `passkey_data` holds the serialized
/// `webauthn-rs` credential; `sign_count` is tracked separately so the
/// regression check reads the authoritative value without deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasskeyRow {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub credential_id: Vec<u8>,
    pub passkey_data: Vec<u8>,
    pub sign_count: i64,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for PasskeyRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            identity_id: row.try_get("identity_id")?,
            credential_id: row.try_get("credential_id")?,
            passkey_data: row.try_get("passkey_data")?,
            sign_count: row.try_get("sign_count")?,
            label: row.try_get("label")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

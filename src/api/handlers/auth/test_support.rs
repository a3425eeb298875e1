//! Shared fixtures for database-backed handler tests.
//!
//! Tests run against a disposable schema inside the database named by
//! `ZORGI_TEST_DSN` and skip silently when the variable is unset, so the
//! unit suite stays runnable without infrastructure.

use super::{AuthConfig, AuthState};
use crate::authz::Role;
use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::{
    Connection, PgConnection, PgPool, Row,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/migrations/20250301000000_init.sql"
));

/// Connect to the test database and apply the schema into a schema of
/// its own, so concurrent tests cannot see each other's rows.
pub(crate) async fn test_pool() -> Result<Option<PgPool>> {
    let Ok(dsn) = std::env::var("ZORGI_TEST_DSN") else {
        eprintln!("Skipping database test: ZORGI_TEST_DSN not set");
        return Ok(None);
    };

    let schema = format!("zorgi_test_{}", Uuid::new_v4().simple());

    let mut admin = PgConnection::connect(&dsn)
        .await
        .context("failed to connect for schema setup")?;
    sqlx::query(&format!(r#"CREATE SCHEMA "{schema}""#))
        .execute(&mut admin)
        .await
        .context("failed to create test schema")?;

    let options = PgConnectOptions::from_str(&dsn)
        .context("invalid ZORGI_TEST_DSN")?
        .options([("search_path", format!("{schema},public"))]);
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to connect test pool")?;

    sqlx::raw_sql(SCHEMA_SQL)
        .execute(&pool)
        .await
        .context("failed to apply schema")?;

    Ok(Some(pool))
}

pub(crate) async fn seed_identity(
    pool: &PgPool,
    email: &str,
    password: &str,
    role: Role,
    active: bool,
) -> Result<Uuid> {
    let hash = super::utils::hash_password(&SecretString::from(password.to_string()))?;
    let row = sqlx::query(
        r"
        INSERT INTO identities (email, password_hash, role, active)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        ",
    )
    .bind(email)
    .bind(hash)
    .bind(role.as_str())
    .bind(active)
    .fetch_one(pool)
    .await
    .context("failed to seed identity")?;
    Ok(row.get("id"))
}

pub(crate) fn test_state() -> Result<Arc<AuthState>> {
    let config = AuthConfig::new(
        "https://care.example.com",
        SecretString::from("test-pepper"),
    )?;
    AuthState::new(config)
}

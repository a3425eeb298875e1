//! PHI access decision endpoint.
//!
//! Data services hold the records; this service answers "may this
//! session act on that resource" and writes the audit record for the
//! decision. The response carries only allowed/denied; deny reasons stay
//! in the ledger.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::str::FromStr;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::auth::principal::require_mfa;
use super::auth::storage::{client_home, home_assignments_for};
use crate::api::handlers::auth::utils::extract_client_ip;
use crate::audit::{AuditLedger, NewAuditRecord, Outcome, PgLedger};
use crate::authz::{Actor, Guard, PhiAction, PhiRequest, Role};

#[derive(Debug, Deserialize, ToSchema)]
pub struct PhiDecisionRequest {
    /// `read` or `mutate`.
    pub action: String,
    /// `client`, `home`, or an unscoped resource type.
    pub resource_type: String,
    pub resource_id: String,
    pub required_roles: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PhiDecisionResponse {
    pub allowed: bool,
}

#[utoipa::path(
    post,
    path = "/v1/phi/decision",
    request_body = PhiDecisionRequest,
    responses(
        (status = 200, description = "Access allowed", body = PhiDecisionResponse),
        (status = 403, description = "Access denied", body = PhiDecisionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 422, description = "Malformed decision request")
    ),
    tag = "phi"
)]
pub async fn phi_decision(
    headers: HeaderMap,
    pool: Extension<PgPool>,
    ledger: Extension<PgLedger>,
    Json(body): Json<PhiDecisionRequest>,
) -> impl IntoResponse {
    let principal = match require_mfa(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    let action = match body.action.as_str() {
        "read" => PhiAction::Read,
        "mutate" => PhiAction::Mutate,
        other => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("Unknown action: {other}"),
            )
                .into_response();
        }
    };

    let mut required_roles = Vec::with_capacity(body.required_roles.len());
    for role in &body.required_roles {
        match Role::from_str(role) {
            Ok(role) => required_roles.push(role),
            Err(err) => {
                return (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response();
            }
        }
    }

    let home_id = match resolve_home_scope(&pool, &body.resource_type, &body.resource_id).await {
        Ok(home_id) => home_id,
        Err(ScopeError::BadResourceId) => {
            return (StatusCode::UNPROCESSABLE_ENTITY, "Invalid resource id").into_response();
        }
        Err(ScopeError::UnknownResource) => {
            // A resource that maps to no home is denied outright; granting
            // by role alone would skip the home-scope check entirely.
            let record = NewAuditRecord::global(&principal.email, action.as_str(), Outcome::Denied)
                .with_actor(principal.identity_id)
                .with_resource(&body.resource_type, &body.resource_id)
                .with_ip(extract_client_ip(&headers))
                .with_detail("unknown_resource");
            match action {
                PhiAction::Mutate => {
                    if let Err(err) = ledger.append(&record).await {
                        error!("Audit append failed for PHI decision: {err}");
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                }
                PhiAction::Read => ledger.append_best_effort(&record).await,
            }
            return (
                StatusCode::FORBIDDEN,
                Json(PhiDecisionResponse { allowed: false }),
            )
                .into_response();
        }
        Err(ScopeError::Db(err)) => {
            error!("Failed to resolve resource scope: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let assignments = match home_assignments_for(&pool, principal.identity_id).await {
        Ok(homes) => homes.into_iter().map(|home| home.id).collect(),
        Err(err) => {
            error!("Failed to load home assignments: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let actor = Actor {
        id: principal.identity_id,
        email: principal.email,
        role: principal.role,
        // The session lookup already filters on active identities.
        active: true,
        assignments,
    };
    let request = PhiRequest {
        action,
        resource_type: body.resource_type,
        resource_id: body.resource_id,
        home_id,
        required_roles,
        ip: extract_client_ip(&headers),
    };

    let guard = Guard::new(&*ledger);
    match guard.authorize(&actor, &request).await {
        Ok(decision) if decision.is_allow() => {
            (StatusCode::OK, Json(PhiDecisionResponse { allowed: true })).into_response()
        }
        Ok(_) => (
            StatusCode::FORBIDDEN,
            Json(PhiDecisionResponse { allowed: false }),
        )
            .into_response(),
        Err(err) => {
            // A mutation must not proceed without its audit record.
            error!("Audit append failed for PHI decision: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

enum ScopeError {
    BadResourceId,
    /// The resource id is well formed but maps to no known row.
    UnknownResource,
    Db(anyhow::Error),
}

/// Map a resource to the home that owns it. Client-rooted resources go
/// through the clients table; home-rooted ones carry their own id.
/// Unknown types are unscoped and fall to the role check alone.
async fn resolve_home_scope(
    pool: &PgPool,
    resource_type: &str,
    resource_id: &str,
) -> Result<Option<Uuid>, ScopeError> {
    match resource_type {
        "home" => {
            let id = Uuid::parse_str(resource_id).map_err(|_| ScopeError::BadResourceId)?;
            Ok(Some(id))
        }
        "client" => {
            let id = Uuid::parse_str(resource_id).map_err(|_| ScopeError::BadResourceId)?;
            match client_home(pool, id).await.map_err(ScopeError::Db)? {
                Some(home_id) => Ok(Some(home_id)),
                None => Err(ScopeError::UnknownResource),
            }
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::handlers::auth::storage::insert_session;
    use crate::api::handlers::auth::test_support::{seed_identity, test_pool};
    use anyhow::Result;
    use axum::http::header::AUTHORIZATION;
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_client_resource_is_denied() -> Result<()> {
        let Some(pool) = test_pool().await? else {
            return Ok(());
        };
        let identity_id =
            seed_identity(&pool, "nurse@zorgi.care", "a password", Role::Caregiver, true).await?;
        let token = insert_session(&pool, identity_id, Duration::from_secs(600), true).await?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());

        let response = phi_decision(
            headers,
            Extension(pool.clone()),
            Extension(PgLedger::new(pool.clone())),
            Json(PhiDecisionRequest {
                action: "read".to_string(),
                resource_type: "client".to_string(),
                resource_id: Uuid::new_v4().to_string(),
                required_roles: vec!["caregiver".to_string()],
            }),
        )
        .await
        .into_response();

        // A client id with no row must not degrade to a role-only check.
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let json: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(json["allowed"], false);

        let ledger = PgLedger::new(pool.clone());
        let records = ledger.recent("global", 5).await?;
        assert!(
            records.iter().any(|record| record.outcome == "denied"
                && record.detail.as_deref() == Some("unknown_resource")),
            "the denial must land in the ledger with its reason"
        );
        Ok(())
    }
}

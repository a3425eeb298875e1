//! Authenticated self-service endpoint.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use sqlx::PgPool;
use tracing::error;

use super::auth::principal::require_mfa;
use super::auth::storage::home_assignments_for;
use super::auth::types::MeResponse;

#[utoipa::path(
    get,
    path = "/v1/me",
    responses(
        (status = 200, description = "Return the authenticated profile.", body = MeResponse),
        (status = 401, description = "Missing, invalid, or MFA-pending session."),
    ),
    tag = "me"
)]
pub async fn get_me(headers: HeaderMap, pool: Extension<PgPool>) -> impl IntoResponse {
    // Setup sessions stop here: /me requires a verified second factor.
    let principal = match require_mfa(&headers, &pool).await {
        Ok(principal) => principal,
        Err(status) => return status.into_response(),
    };

    match home_assignments_for(&pool, principal.identity_id).await {
        Ok(homes) => {
            let response = MeResponse {
                id: principal.identity_id,
                email: principal.email,
                role: principal.role.as_str().to_string(),
                homes,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            error!("Failed to load home assignments: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

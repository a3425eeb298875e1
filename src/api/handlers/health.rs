use crate::api::GIT_COMMIT_HASH;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
}

/// Pings the database through a freshly acquired connection so pool
/// exhaustion surfaces here instead of on a staff request.
async fn ping_database(pool: &PgPool) -> Result<(), StatusCode> {
    let acquire_span = info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );

    let mut conn = pool.acquire().instrument(acquire_span).await.map_err(|error| {
        error!("Failed to acquire database connection: {}", error);

        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");

    conn.ping().instrument(ping_span).await.map_err(|error| {
        error!("Failed to ping database: {}", error);

        StatusCode::SERVICE_UNAVAILABLE
    })
}

fn x_app_headers(health: &Health) -> HeaderMap {
    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let mut headers = HeaderMap::new();

    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            debug!("X-App header: {:?}", value);

            headers.insert("X-App", value);
        }
        Err(err) => {
            error!("Failed to parse X-App header: {}", err);
        }
    }

    headers
}

#[utoipa::path(
    get,
    path = "/health",
    responses (
        (status = 200, description = "Database is healthy", body = [Health]),
        (status = 503, description = "Database is unhealthy", body = [Health])
    ),
    tag = "health"
)]
pub async fn health(method: Method, pool: Extension<PgPool>) -> impl IntoResponse {
    let result = ping_database(&pool.0).await;

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let headers = x_app_headers(&health);

    // HEAD gets the headers only.
    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let status = result.err().unwrap_or(StatusCode::OK);

    (status, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_app_header_uses_short_commit_hash() {
        let health = Health {
            commit: "0123456789abcdef".to_string(),
            name: "zorgi".to_string(),
            version: "0.1.0".to_string(),
            database: "ok".to_string(),
        };

        let headers = x_app_headers(&health);
        let value = headers.get("X-App").unwrap().to_str().unwrap();

        assert_eq!(value, "zorgi:0.1.0:0123456");
    }

    #[test]
    fn x_app_header_omits_hash_when_commit_is_short() {
        let health = Health {
            commit: String::new(),
            name: "zorgi".to_string(),
            version: "0.1.0".to_string(),
            database: "error".to_string(),
        };

        let headers = x_app_headers(&health);
        let value = headers.get("X-App").unwrap().to_str().unwrap();

        assert_eq!(value, "zorgi:0.1.0:");
    }
}

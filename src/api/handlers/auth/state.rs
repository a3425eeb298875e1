//! Configuration and shared in-memory state for the auth handlers.

use crate::authz::Role;
use crate::webauthn::PasskeyCeremony;
use anyhow::{Context, Result};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;

const DEFAULT_SESSION_TTL_SECONDS: u64 = 12 * 60 * 60;
const DEFAULT_SETUP_SESSION_TTL_SECONDS: u64 = 15 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: u64 = 30 * 60;
const DEFAULT_INVITATION_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_LOGIN_TTL_SECONDS: u64 = 5 * 60;

/// Tunables for the auth flows. Relying-party values default to the
/// frontend URL; overrides exist for split-domain deployments.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub frontend_base_url: String,
    pub rp_id: String,
    pub rp_origin: String,
    pub rp_name: String,
    pub session_ttl: Duration,
    pub setup_session_ttl: Duration,
    pub reset_token_ttl: Duration,
    pub invitation_ttl: Duration,
    pub login_ttl: Duration,
    pub session_cookie_secure: bool,
    pub backup_code_pepper: SecretString,
}

impl AuthConfig {
    /// Derive defaults from the frontend base URL.
    ///
    /// # Errors
    /// Returns error if the URL cannot be parsed or has no host.
    pub fn new(frontend_base_url: &str, backup_code_pepper: SecretString) -> Result<Self> {
        let url = Url::parse(frontend_base_url)
            .with_context(|| format!("Invalid frontend URL: {frontend_base_url}"))?;
        let rp_id = url
            .host_str()
            .with_context(|| format!("Frontend URL has no host: {frontend_base_url}"))?
            .to_string();
        let rp_origin = url.origin().ascii_serialization();

        Ok(Self {
            frontend_base_url: frontend_base_url.trim_end_matches('/').to_string(),
            rp_id,
            rp_origin,
            rp_name: "Zorgi".to_string(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECONDS),
            setup_session_ttl: Duration::from_secs(DEFAULT_SETUP_SESSION_TTL_SECONDS),
            reset_token_ttl: Duration::from_secs(DEFAULT_RESET_TOKEN_TTL_SECONDS),
            invitation_ttl: Duration::from_secs(DEFAULT_INVITATION_TTL_SECONDS),
            login_ttl: Duration::from_secs(DEFAULT_LOGIN_TTL_SECONDS),
            session_cookie_secure: url.scheme() == "https",
            backup_code_pepper,
        })
    }

    #[must_use]
    pub fn with_rp_id(mut self, rp_id: &str) -> Self {
        self.rp_id = rp_id.to_string();
        self
    }

    #[must_use]
    pub fn with_rp_origin(mut self, rp_origin: &str) -> Self {
        self.rp_origin = rp_origin.to_string();
        self
    }

    #[must_use]
    pub fn with_rp_name(mut self, rp_name: &str) -> Self {
        self.rp_name = rp_name.to_string();
        self
    }

    #[must_use]
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_setup_session_ttl(mut self, ttl: Duration) -> Self {
        self.setup_session_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl(mut self, ttl: Duration) -> Self {
        self.reset_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_invitation_ttl(mut self, ttl: Duration) -> Self {
        self.invitation_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_login_ttl(mut self, ttl: Duration) -> Self {
        self.login_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_session_cookie_secure(mut self, secure: bool) -> Self {
        self.session_cookie_secure = secure;
        self
    }
}

/// A password-verified login waiting for its second factor. Single-use
/// and TTL-bounded, keyed by the opaque `login_id` handed back to the
/// frontend.
pub struct PendingLogin {
    pub identity_id: Uuid,
    pub email: String,
    pub role: Role,
    pub auth_id: Option<Uuid>,
    pub ip: Option<String>,
    pub created_at: Instant,
}

/// Shared state handed to every auth handler via an axum Extension.
pub struct AuthState {
    pub config: AuthConfig,
    pub ceremony: PasskeyCeremony,
    pending_logins: Mutex<HashMap<Uuid, PendingLogin>>,
}

impl AuthState {
    /// # Errors
    /// Returns error if the relying-party configuration is invalid.
    pub fn new(config: AuthConfig) -> Result<Arc<Self>> {
        let ceremony = PasskeyCeremony::new(&config.rp_id, &config.rp_origin, &config.rp_name)?;
        Ok(Arc::new(Self {
            config,
            ceremony,
            pending_logins: Mutex::new(HashMap::new()),
        }))
    }

    /// Store a pending login, pruning expired entries on the way.
    pub async fn store_pending_login(&self, login: PendingLogin) -> Uuid {
        let login_id = Uuid::new_v4();
        let ttl = self.config.login_ttl;
        let mut logins = self.pending_logins.lock().await;
        logins.retain(|_, entry| entry.created_at.elapsed() < ttl);
        logins.insert(login_id, login);
        login_id
    }

    /// Take a pending login, consuming it. Expired entries are dropped on
    /// take, so a stale `login_id` behaves like an unknown one.
    pub async fn take_pending_login(&self, login_id: Uuid) -> Option<PendingLogin> {
        let mut logins = self.pending_logins.lock().await;
        let login = logins.remove(&login_id)?;
        if login.created_at.elapsed() >= self.config.login_ttl {
            return None;
        }
        Some(login)
    }
}

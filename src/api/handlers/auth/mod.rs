//! Auth handlers and supporting modules.
//!
//! Authentication is two-stage for every role: a password check followed
//! by a passkey assertion. Sysadmins additionally hold single-use backup
//! codes as the fallback for a lost authenticator.
//!
//! ## Session model
//!
//! Sessions are opaque bearer tokens, stored hashed. A session carries an
//! `mfa_verified` flag: login issues an unverified setup session only when
//! the identity has no passkey yet, and that session can reach nothing but
//! the passkey-setup endpoints. Every other endpoint requires a verified
//! session.
//!
//! ## One-time tokens
//!
//! Password resets and staff invitations ride on hashed single-use tokens
//! with short TTLs, delivered through the email outbox so the token insert
//! and the email enqueue commit atomically.

pub(crate) mod login;
pub(crate) mod mfa;
pub(crate) mod principal;
pub(crate) mod reset;
mod state;
pub(crate) mod storage;
pub(crate) mod types;
pub(crate) mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use state::{AuthConfig, AuthState};

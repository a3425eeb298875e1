//! API handlers for Zorgi.
//!
//! Route handlers are grouped by concern: `auth` for the login and
//! credential lifecycle, `me` for the caller's own profile, `phi` for the
//! PHI access decision endpoint, and `health` for the service surface.

pub mod auth;
pub mod health;
pub mod me;
pub mod phi;

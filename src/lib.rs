//! # Zorgi (Care-Home Staff Authentication & PHI Audit)
//!
//! `zorgi` authenticates care-home staff and answers PHI access questions
//! for the surrounding data services. It is the only component that issues
//! sessions and the only writer of the PHI audit ledger.
//!
//! ## Authentication Model
//!
//! Every staff account authenticates with a password plus a passkey
//! (WebAuthn). Sysadmins additionally hold single-use backup codes as the
//! fallback for a lost authenticator; other roles recover through support.
//! Login responses are deliberately uniform: unknown emails, inactive
//! accounts, and wrong passwords are indistinguishable from outside.
//!
//! ## Authorization & Audit
//!
//! - **Roles:** `admin` (all homes), `caregiver` (assigned homes only),
//!   `sysadmin` (operations, never PHI).
//! - **Home scope:** caregivers only reach resources owned by a home they
//!   are actively assigned to.
//! - **Ledger:** every PHI decision writes exactly one append-only audit
//!   record; PHI mutations cannot commit without theirs.

pub mod api;
pub mod audit;
pub mod authz;
pub mod cli;
pub mod webauthn;

pub use api::{APP_USER_AGENT, GIT_COMMIT_HASH};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_commit_hash_is_hex_or_unknown() {
        // "unknown" happens when building outside a git checkout.
        if GIT_COMMIT_HASH != "unknown" {
            assert!(GIT_COMMIT_HASH.len() >= 7, "got: {GIT_COMMIT_HASH}");
            assert!(
                GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
                "got: {GIT_COMMIT_HASH}"
            );
        }
    }

    #[test]
    fn user_agent_carries_name_and_version() {
        let expected = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        assert_eq!(APP_USER_AGENT, expected);
    }
}

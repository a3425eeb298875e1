//! Passkey (`WebAuthn`) ceremonies for the possession factor.
//!
//! Passkeys are the second factor layered over the password step, not a
//! password replacement. Challenges are single-use and TTL-bound; assertion
//! results are checked against the stored signature counter before a session
//! is issued.

pub mod ceremony;
pub mod models;
pub mod repo;

pub use ceremony::{CeremonyError, PasskeyCeremony, deserialize_credential, serialize_credential};
pub use repo::PasskeyRepo;

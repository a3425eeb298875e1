//! Append-only audit ledger for PHI access records.
//!
//! The ledger interface exposes creation and retrieval only. No code path in
//! this crate can update or delete an existing record; append-only semantics
//! are enforced at the interface boundary, not by convention.

mod ledger;

pub use ledger::{
    AuditLedger, AuditRecord, MemoryLedger, NewAuditRecord, Outcome, PgLedger, GLOBAL_PARTITION,
};

//! Audit Log Integrity Subsystem
//!
//! Chained checksums, the append-only store and the integrity verifier

pub mod audit;
pub mod checksum;
pub mod verify;

pub use audit::{
    AuditAction, AuditCategory, AuditEntry, AuditError, AuditLog, AuditPage, AuditQuery,
    NewAuditEntry, SeqRange, Severity, SortOrder, AUDIT_ERROR_TARGET,
};
pub use audit::{canonical_json, format_timestamp};
pub use checksum::{chain_checksum, ChecksumPayload, CHAIN_SEED};
pub use verify::{IntegrityVerifier, VerificationReport};

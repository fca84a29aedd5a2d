//! Integrity verification of the audit chain.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::{AuditAction, AuditCategory, AuditError, AuditLog, NewAuditEntry, SeqRange, Severity};
use super::checksum::chain_checksum;

/// Outcome of one verification run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub first_invalid_id: Option<String>,
    pub first_invalid_seq: Option<i64>,
    pub severity: Severity,
}

impl VerificationReport {
    pub fn is_intact(&self) -> bool {
        self.invalid == 0
    }

    /// A broken chain becomes an `IntegrityError` carrying the first offender
    pub fn into_result(self) -> Result<Self, AuditError> {
        match &self.first_invalid_id {
            Some(id) => Err(AuditError::ChainBroken {
                first_invalid_id: id.clone(),
                invalid: self.invalid,
            }),
            None => Ok(self),
        }
    }
}

#[derive(Clone)]
pub struct IntegrityVerifier {
    log: AuditLog,
}

impl IntegrityVerifier {
    pub fn new(log: AuditLog) -> Self {
        Self { log }
    }

    /// Walk `range` in insertion order and recompute the chain.
    ///
    /// Once an entry fails, it and every later entry count as suspect. The
    /// scan still runs to the end so `invalid` is exact. The run is recorded
    /// as an `AUDIT_VERIFY` entry afterwards.
    pub fn verify(&self, range: &SeqRange, limit: Option<usize>) -> Result<VerificationReport, AuditError> {
        if let (Some(from), Some(to)) = (range.from_seq, range.to_seq) {
            if from > to {
                return Err(AuditError::InvalidRange(format!("from_seq {} is after to_seq {}", from, to)));
            }
        }

        let rows = self.log.scan_raw(range, limit)?;

        let mut expected_prev = match rows.first() {
            Some(first) => self.log.checksum_before(first.seq)?,
            None => String::new(),
        };
        let mut valid = 0usize;
        let mut invalid = 0usize;
        let mut first_invalid: Option<(String, i64)> = None;

        for row in &rows {
            let recomputed = chain_checksum(&expected_prev, &row.payload());
            if first_invalid.is_none() && recomputed == row.checksum {
                valid += 1;
            } else {
                invalid += 1;
                if first_invalid.is_none() {
                    first_invalid = Some((row.id.clone(), row.seq));
                }
            }
            expected_prev = recomputed;
        }

        let severity = if invalid > 0 { Severity::Warning } else { Severity::Info };
        let (first_invalid_id, first_invalid_seq) = match first_invalid {
            Some((id, seq)) => (Some(id), Some(seq)),
            None => (None, None),
        };

        let report = VerificationReport {
            total: rows.len(),
            valid,
            invalid,
            first_invalid_id,
            first_invalid_seq,
            severity,
        };

        if report.is_intact() {
            info!(total = report.total, "audit chain verified");
        } else {
            warn!(
                total = report.total,
                invalid = report.invalid,
                first_invalid = ?report.first_invalid_id,
                "audit chain broken"
            );
        }

        self.log.record(
            NewAuditEntry::new(AuditAction::AuditVerify, AuditCategory::System, "audit_log")
                .with_severity(severity)
                .with_metadata(serde_json::json!({
                    "from_seq": range.from_seq,
                    "to_seq": range.to_seq,
                    "limit": limit,
                    "total": report.total,
                    "valid": report.valid,
                    "invalid": report.invalid,
                    "first_invalid_id": report.first_invalid_id,
                })),
        );

        Ok(report)
    }
}

//! Failure classes shared by the HTTP and CLI surfaces

use serde::Serialize;

use crate::engine::audit::AuditError;
use crate::engine::backup::BackupError;
use crate::engine::restore::RestoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any state change
    Validation,
    NotFound,
    /// Disk full, permissions, removed media; left in the last safe state
    Io,
    /// Chain break or damaged artifact, never auto-remediated
    Integrity,
    /// Another operation holds the lock; retry later
    Concurrency,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io_error",
            ErrorKind::Integrity => "integrity_error",
            ErrorKind::Concurrency => "concurrency_conflict",
            ErrorKind::Internal => "internal_error",
        }
    }
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for AuditError {
    fn kind(&self) -> ErrorKind {
        match self {
            AuditError::InvalidRange(_) | AuditError::InvalidField { .. } => ErrorKind::Validation,
            AuditError::ChainBroken { .. } => ErrorKind::Integrity,
            AuditError::Database(_) | AuditError::Sqlite(_) => ErrorKind::Io,
            AuditError::Metadata(_) | AuditError::Poisoned => ErrorKind::Internal,
        }
    }
}

impl Classify for BackupError {
    fn kind(&self) -> ErrorKind {
        match self {
            BackupError::InvalidName(_) | BackupError::MissingSecret | BackupError::DecryptionFailed => {
                ErrorKind::Validation
            }
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::DiskFull(_)
            | BackupError::PermissionDenied(_)
            | BackupError::Unavailable(_)
            | BackupError::Io(_) => ErrorKind::Io,
            BackupError::SourceBusy(_) | BackupError::AlreadyExists(_) | BackupError::Locked(_) => {
                ErrorKind::Concurrency
            }
            BackupError::Corrupt(_) => ErrorKind::Integrity,
            BackupError::Database(_) | BackupError::EncryptionFailed(_) | BackupError::Manifest(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl Classify for RestoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            RestoreError::Backup(e) => e.kind(),
            RestoreError::Audit(e) => e.kind(),
            RestoreError::Locked(_) | RestoreError::Interrupted(_) => ErrorKind::Concurrency,
            RestoreError::Io(_) | RestoreError::RolledBack { .. } => ErrorKind::Io,
            RestoreError::Marker(_) | RestoreError::Database(_) | RestoreError::RollbackFailed { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::locks::{LockError, LockType};
    use crate::engine::restore::RestorePhase;

    #[test]
    fn test_classification() {
        assert_eq!(BackupError::InvalidName("../x".into()).kind(), ErrorKind::Validation);
        assert_eq!(BackupError::DiskFull("snapshot".into()).kind(), ErrorKind::Io);
        assert_eq!(
            RestoreError::Locked(LockError::BlockedBy {
                requested: LockType::Restore,
                blocking: LockType::Backup,
                description: String::new(),
            })
            .kind(),
            ErrorKind::Concurrency
        );
        assert_eq!(
            AuditError::ChainBroken {
                first_invalid_id: "e-1".into(),
                invalid: 3
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            RestoreError::RolledBack {
                phase: RestorePhase::Verifying,
                cause: "x".into()
            }
            .kind(),
            ErrorKind::Io
        );
        assert_eq!(
            RestoreError::Backup(BackupError::DecryptionFailed).kind(),
            ErrorKind::Validation
        );
    }
}

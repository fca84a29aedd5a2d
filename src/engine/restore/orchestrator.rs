//! Restore Orchestrator
//!
//! Swaps a backup artifact in for the live store:
//! `IDLE -> VALIDATING -> SWAPPING -> VERIFYING -> {COMMITTED, ROLLED_BACK}`.
//! The live store always ends usable. A failure after the live file has been
//! moved puts the very same file back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::state::{RestoreMarker, RestorePaths, RestorePhase, StateError, Transition};
use crate::engine::audit::{AuditAction, AuditCategory, AuditError, AuditLog, NewAuditEntry, Severity};
use crate::engine::backup::{
    cipher, file_checksum, parse_artifact_name, BackupArtifact, BackupCatalog, BackupError, RecoveryOutcome,
    RecoveryTest, RunLog,
};
use crate::engine::database::{structural_check, DatabaseError};
use crate::engine::keystore::InstallationSecrets;
use crate::engine::locks::{LockError, LockType, OperationLock};
use crate::engine::signal::RestartSignal;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Locked(#[from] LockError),
    #[error("An interrupted restore of {0} must be recovered first")]
    Interrupted(String),
    #[error("Restore marker error: {0}")]
    Marker(#[from] StateError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("IO error during restore: {0}")]
    Io(#[from] std::io::Error),
    #[error("Restore rolled back during {phase}: {cause}")]
    RolledBack { phase: RestorePhase, cause: String },
    #[error("Rollback failed during {phase}: {cause}; original store left at {quarantine}")]
    RollbackFailed {
        phase: RestorePhase,
        cause: String,
        quarantine: String,
    },
}

/// Points where a test build can force the restore to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// After the live store moved to quarantine, before the candidate moves in
    SwapIn,
    /// Inside the structural check of the swapped-in store
    Verification,
    /// Verification fails and the rollback after it cannot move the original
    /// back, leaving it in quarantine
    Rollback,
}

/// A committed restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub artifact: String,
    pub phase: RestorePhase,
    pub transitions: Vec<Transition>,
    /// Age of the artifact when the restore began
    pub rpo_seconds: i64,
    pub rto_ms: u64,
    pub restart_required: bool,
}

impl RestoreOutcome {
    /// Phase names in the order they were entered
    pub fn trail(&self) -> Vec<&'static str> {
        self.transitions.iter().map(|t| t.phase.as_str()).collect()
    }
}

/// What startup recovery found and did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredRestore {
    pub artifact: String,
    pub actor_id: Option<String>,
    pub interrupted_phase: RestorePhase,
    pub outcome: RecoveryOutcome,
    pub started_at: DateTime<Utc>,
    /// Failure the interrupted attempt recorded before it stopped
    pub failure: Option<String>,
}

impl RecoveredRestore {
    pub fn audit_entry(&self) -> NewAuditEntry {
        NewAuditEntry::new(AuditAction::RestoreRecovered, AuditCategory::Backup, "restore")
            .with_actor(self.actor_id.as_deref())
            .with_entity_id(&self.artifact)
            // A terminal phase means only the marker cleanup was lost
            .with_severity(if self.interrupted_phase.is_terminal() {
                Severity::Info
            } else {
                Severity::Warning
            })
            .with_metadata(serde_json::json!({
                "interrupted_phase": self.interrupted_phase.as_str(),
                "outcome": self.outcome.as_str(),
                "started_at": self.started_at,
                "failure": self.failure,
            }))
    }
}

struct Failure {
    phase: RestorePhase,
    cause: String,
}

/// How the exclusive section of a restore ended
enum Swap {
    /// The live store was never moved
    NotStarted(RestoreError),
    Finished(Result<(), Failure>),
    /// The original could not be moved back out of quarantine
    Stranded { failure: Failure, rollback: String },
}

impl Failure {
    fn at(phase: RestorePhase, cause: impl ToString) -> Self {
        Self {
            phase,
            cause: cause.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RestoreOrchestrator {
    audit: AuditLog,
    catalog: BackupCatalog,
    locks: OperationLock,
    secrets: InstallationSecrets,
    restart: RestartSignal,
    #[cfg(any(test, feature = "fault-injection"))]
    fault: Option<FaultPoint>,
}

impl RestoreOrchestrator {
    pub fn new(
        audit: AuditLog,
        catalog: BackupCatalog,
        locks: OperationLock,
        secrets: InstallationSecrets,
        restart: RestartSignal,
    ) -> Self {
        Self {
            audit,
            catalog,
            locks,
            secrets,
            restart,
            #[cfg(any(test, feature = "fault-injection"))]
            fault: None,
        }
    }

    /// Force a failure at `point` on every subsequent restore
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn with_fault(mut self, point: FaultPoint) -> Self {
        self.fault = Some(point);
        self
    }

    #[cfg(any(test, feature = "fault-injection"))]
    fn fault_at(&self, point: FaultPoint) -> Option<String> {
        (self.fault == Some(point)).then(|| format!("injected fault at {:?}", point))
    }

    #[cfg(not(any(test, feature = "fault-injection")))]
    fn fault_at(&self, _point: FaultPoint) -> Option<String> {
        None
    }

    /// Replace the live store with `file_name` from the catalog.
    ///
    /// Not cancellable once SWAPPING begins; run it where dropping the caller
    /// cannot abort it.
    pub fn restore(&self, file_name: &str, actor: Option<&str>) -> Result<RestoreOutcome, RestoreError> {
        parse_artifact_name(file_name)?;
        let _lock = self.locks.acquire(LockType::Restore)?;

        let started = Instant::now();
        let db = self.audit.database().clone();
        let paths = RestorePaths::for_live(db.path());

        if let Some(existing) = RestoreMarker::load(&paths.marker)? {
            return Err(RestoreError::Interrupted(existing.artifact));
        }

        let mut marker = RestoreMarker::new(file_name, actor);
        info!(artifact = file_name, "restore started");

        // VALIDATING: nothing outside the candidate path is touched
        marker.advance(RestorePhase::Validating, &paths.marker)?;
        self.log_phase(AuditAction::RestoreValidating, &marker, serde_json::json!({}));

        let artifact = match self.stage_candidate(file_name, &paths) {
            Ok(artifact) => artifact,
            Err(e) => {
                let _ = fs::remove_file(&paths.candidate);
                let _ = RestoreMarker::remove(&paths.marker);
                warn!(artifact = file_name, error = %e, "restore rejected");
                self.log_phase(
                    AuditAction::RestoreRejected,
                    &marker,
                    serde_json::json!({ "error": e.to_string() }),
                );
                self.record_test(&marker, RecoveryOutcome::Failed, 0, started, Some(e.to_string()));
                return Err(e);
            }
        };
        let rpo_seconds = marker.started_at.signed_duration_since(artifact.created_at).num_seconds();

        self.log_phase(AuditAction::RestoreSwapping, &marker, serde_json::json!({}));

        // SWAPPING and VERIFYING run with local appends paused and pool
        // checkouts suspended. Audit writes wait until both guards drop.
        let swap = {
            let staged = self.audit.pause_appends().map_err(RestoreError::from).and_then(|pause| {
                let access = db.exclusive()?;
                let sum = file_checksum(&paths.live)?;
                Ok((pause, access, sum))
            });
            match staged {
                Err(e) => Swap::NotStarted(e),
                Ok((_pause, mut access, original_checksum)) => {
                    marker.original_checksum = Some(original_checksum);

                    let result = match marker.advance(RestorePhase::Swapping, &paths.marker) {
                        Ok(()) => self.swap_and_verify(&paths, &mut marker),
                        Err(e) => Err(Failure::at(RestorePhase::Swapping, e)),
                    };

                    let swap = match result {
                        Ok(()) => {
                            marker.settle(RestorePhase::Committing, &paths.marker);
                            if let Err(e) = fs::remove_file(&paths.quarantine) {
                                warn!(error = %e, "quarantined store not removed");
                            }
                            Swap::Finished(Ok(()))
                        }
                        Err(failure) => match self.roll_back(&paths) {
                            Ok(()) => Swap::Finished(Err(failure)),
                            Err(e) => Swap::Stranded {
                                failure,
                                rollback: e.to_string(),
                            },
                        },
                    };

                    if let Err(e) = access.reconnect() {
                        error!(error = %e, "connection pool not rebuilt after restore");
                    }
                    swap
                }
            }
        };

        let result = match swap {
            Swap::Finished(result) => result,
            Swap::NotStarted(e) => {
                let _ = fs::remove_file(&paths.candidate);
                let _ = RestoreMarker::remove(&paths.marker);
                warn!(artifact = file_name, error = %e, "restore abandoned before the swap");
                self.log_phase(
                    AuditAction::RestoreRejected,
                    &marker,
                    serde_json::json!({ "error": e.to_string(), "failed_phase": RestorePhase::Swapping.as_str() }),
                );
                self.record_test(&marker, RecoveryOutcome::Failed, rpo_seconds, started, Some(e.to_string()));
                return Err(e);
            }
            Swap::Stranded { failure, rollback } => {
                let cause = format!("{}; rollback: {}", failure.cause, rollback);
                let quarantine = paths.quarantine.display().to_string();
                error!(phase = failure.phase.as_str(), error = %rollback, "restore rollback failed");

                // The marker stays at its last phase for startup recovery
                marker.failure = Some(cause.clone());
                if let Err(e) = marker.save(&paths.marker) {
                    error!(error = %e, "restore marker not updated after failed rollback");
                }
                self.audit.record(
                    self.phase_entry(AuditAction::RestoreRolledBack, &marker)
                        .with_severity(Severity::Critical)
                        .with_metadata(serde_json::json!({
                            "failed_phase": failure.phase.as_str(),
                            "error": failure.cause,
                            "rollback_failed": true,
                            "rollback_error": rollback,
                            "quarantine": quarantine,
                            "original_intact": false,
                            "transitions": marker.transitions,
                        })),
                );
                self.record_test(&marker, RecoveryOutcome::Failed, rpo_seconds, started, Some(cause.clone()));

                return Err(RestoreError::RollbackFailed {
                    phase: failure.phase,
                    cause,
                    quarantine,
                });
            }
        };
        let original_checksum = marker.original_checksum.clone().unwrap_or_default();

        match result {
            Ok(()) => {
                marker.settle(RestorePhase::Committed, &paths.marker);
                let rto_ms = started.elapsed().as_millis() as u64;

                // The original chain left with the old store; the restored
                // store receives the whole trail here.
                self.log_phase(AuditAction::RestoreVerifying, &marker, serde_json::json!({ "result": "ok" }));
                self.log_phase(
                    AuditAction::RestoreCommitted,
                    &marker,
                    serde_json::json!({
                        "transitions": marker.transitions,
                        "rpo_seconds": rpo_seconds,
                        "rto_ms": rto_ms,
                        "original_checksum": original_checksum,
                    }),
                );
                self.record_test(&marker, RecoveryOutcome::Committed, rpo_seconds, started, None);
                self.restart.request();
                let _ = RestoreMarker::remove(&paths.marker);

                info!(artifact = file_name, rpo_seconds, rto_ms, "restore committed, restart required");
                Ok(RestoreOutcome {
                    artifact: file_name.to_string(),
                    phase: RestorePhase::Committed,
                    transitions: marker.transitions,
                    rpo_seconds,
                    rto_ms,
                    restart_required: true,
                })
            }
            Err(failure) => {
                marker.settle(RestorePhase::RolledBack, &paths.marker);
                let original_intact = file_checksum(&paths.live)
                    .map(|sum| sum == original_checksum)
                    .unwrap_or(false);

                warn!(
                    artifact = file_name,
                    phase = failure.phase.as_str(),
                    cause = %failure.cause,
                    original_intact,
                    "restore rolled back"
                );

                if failure.phase == RestorePhase::Verifying {
                    self.log_phase(
                        AuditAction::RestoreVerifying,
                        &marker,
                        serde_json::json!({ "result": "failed", "error": failure.cause }),
                    );
                }
                self.audit.record(
                    self.phase_entry(AuditAction::RestoreRolledBack, &marker)
                        .with_severity(if original_intact { Severity::Error } else { Severity::Critical })
                        .with_metadata(serde_json::json!({
                            "failed_phase": failure.phase.as_str(),
                            "error": failure.cause,
                            "original_intact": original_intact,
                            "transitions": marker.transitions,
                        })),
                );
                self.record_test(
                    &marker,
                    RecoveryOutcome::RolledBack,
                    rpo_seconds,
                    started,
                    Some(failure.cause.clone()),
                );
                let _ = RestoreMarker::remove(&paths.marker);

                Err(RestoreError::RolledBack {
                    phase: failure.phase,
                    cause: failure.cause,
                })
            }
        }
    }

    /// Check the artifact and leave a plain, structurally sound copy at the
    /// candidate path.
    fn stage_candidate(&self, file_name: &str, paths: &RestorePaths) -> Result<BackupArtifact, RestoreError> {
        let artifact = self.catalog.get(file_name)?;
        let source = self.catalog.resolve(file_name)?;

        if let Some(expected) = &artifact.checksum {
            let actual = file_checksum(&source).map_err(|e| BackupError::from_io(file_name, e))?;
            if &actual != expected {
                return Err(BackupError::Corrupt(format!("{} does not match its manifest checksum", file_name)).into());
            }
        }

        let _ = fs::remove_file(&paths.candidate);
        if artifact.encrypted {
            let secret = self.secrets.backup_secret().ok_or(BackupError::MissingSecret)?;
            cipher::decrypt_file(&source, &paths.candidate, secret)?;
        } else {
            fs::copy(&source, &paths.candidate).map_err(|e| BackupError::from_io("restore candidate", e))?;
            fs::File::open(&paths.candidate)
                .and_then(|f| f.sync_all())
                .map_err(|e| BackupError::from_io("restore candidate", e))?;
        }

        structural_check(&paths.candidate)
            .map_err(|e| BackupError::Corrupt(format!("{} failed the structural check: {}", file_name, e)))?;
        Ok(artifact)
    }

    fn swap_and_verify(&self, paths: &RestorePaths, marker: &mut RestoreMarker) -> Result<(), Failure> {
        fs::rename(&paths.live, &paths.quarantine).map_err(|e| Failure::at(RestorePhase::Swapping, e))?;

        if let Some(cause) = self.fault_at(FaultPoint::SwapIn) {
            return Err(Failure::at(RestorePhase::Swapping, cause));
        }
        fs::rename(&paths.candidate, &paths.live).map_err(|e| Failure::at(RestorePhase::Swapping, e))?;

        marker
            .advance(RestorePhase::Verifying, &paths.marker)
            .map_err(|e| Failure::at(RestorePhase::Verifying, e))?;

        structural_check(&paths.live).map_err(|e| Failure::at(RestorePhase::Verifying, e))?;
        if let Some(cause) = self
            .fault_at(FaultPoint::Verification)
            .or_else(|| self.fault_at(FaultPoint::Rollback))
        {
            return Err(Failure::at(RestorePhase::Verifying, cause));
        }
        Ok(())
    }

    fn roll_back(&self, paths: &RestorePaths) -> std::io::Result<()> {
        if let Some(cause) = self.fault_at(FaultPoint::Rollback) {
            return Err(std::io::Error::other(cause));
        }
        rollback(paths)
    }

    fn phase_entry(&self, action: AuditAction, marker: &RestoreMarker) -> NewAuditEntry {
        NewAuditEntry::new(action, AuditCategory::Backup, "restore")
            .with_actor(marker.actor_id.as_deref())
            .with_entity_id(&marker.artifact)
    }

    fn log_phase(&self, action: AuditAction, marker: &RestoreMarker, metadata: serde_json::Value) {
        let severity = match action {
            AuditAction::RestoreRejected => Severity::Error,
            AuditAction::RestoreCommitted => Severity::Warning,
            _ => Severity::Info,
        };
        self.audit.record(
            self.phase_entry(action, marker)
                .with_severity(severity)
                .with_metadata(metadata),
        );
    }

    fn record_test(
        &self,
        marker: &RestoreMarker,
        outcome: RecoveryOutcome,
        rpo_seconds: i64,
        started: Instant,
        error: Option<String>,
    ) {
        let test = RecoveryTest {
            id: Uuid::new_v4().to_string(),
            artifact: marker.artifact.clone(),
            started_at: marker.started_at,
            outcome,
            rpo_seconds,
            rto_ms: started.elapsed().as_millis() as u64,
            error,
        };
        if let Err(e) = RunLog::new(self.audit.database().clone()).record_recovery_test(&test) {
            error!(error = %e, "failed to record recovery test");
        }
    }
}

/// Put the quarantined original back over whatever is at the live path
fn rollback(paths: &RestorePaths) -> std::io::Result<()> {
    if paths.quarantine.exists() {
        fs::rename(&paths.quarantine, &paths.live)?;
    }
    if paths.candidate.exists() {
        fs::remove_file(&paths.candidate)?;
    }
    Ok(())
}

/// Resolve a restore left behind by a crash. Runs before the live store is
/// opened; returns what was found so the caller can log it once the store is
/// available.
pub fn recover_interrupted(live: &Path) -> Result<Option<RecoveredRestore>, RestoreError> {
    let paths = RestorePaths::for_live(live);
    let Some(marker) = RestoreMarker::load(&paths.marker)? else {
        return Ok(None);
    };

    let outcome = match marker.phase {
        RestorePhase::Committing | RestorePhase::Committed => {
            if paths.quarantine.exists() {
                fs::remove_file(&paths.quarantine)?;
            }
            if paths.candidate.exists() {
                fs::remove_file(&paths.candidate)?;
            }
            RecoveryOutcome::Committed
        }
        RestorePhase::Swapping | RestorePhase::Verifying => {
            rollback(&paths)?;
            RecoveryOutcome::RolledBack
        }
        RestorePhase::Idle | RestorePhase::Validating | RestorePhase::RolledBack => {
            // Quarantine only exists here if the rollback itself was cut short
            rollback(&paths)?;
            RecoveryOutcome::RolledBack
        }
    };

    RestoreMarker::remove(&paths.marker)?;
    warn!(
        artifact = %marker.artifact,
        phase = marker.phase.as_str(),
        outcome = outcome.as_str(),
        "interrupted restore recovered"
    );

    Ok(Some(RecoveredRestore {
        artifact: marker.artifact,
        actor_id: marker.actor_id,
        interrupted_phase: marker.phase,
        outcome,
        started_at: marker.started_at,
        failure: marker.failure,
    }))
}

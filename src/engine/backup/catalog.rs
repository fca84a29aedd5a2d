//! Backup Catalog
//!
//! Owns the contents of the backup directory: listing, retention and
//! deletion of artifacts.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{parse_artifact_name, ArtifactManifest, BackupArtifact, BackupError, MANIFEST_SUFFIX};
use crate::engine::audit::{AuditAction, AuditCategory, AuditLog, NewAuditEntry, Severity};
use crate::engine::locks::{LockType, OperationLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 5,
            max_age_days: 14,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    /// Artifacts that should have gone but could not be removed
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct BackupCatalog {
    backup_dir: PathBuf,
    audit: AuditLog,
    locks: OperationLock,
}

impl BackupCatalog {
    pub fn new(backup_dir: PathBuf, audit: AuditLog, locks: OperationLock) -> Self {
        Self {
            backup_dir,
            audit,
            locks,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Artifacts newest first. A missing directory is an empty catalog.
    pub fn list(&self) -> Result<Vec<BackupArtifact>, BackupError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::from_io("backup directory", e)),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::from_io("backup directory", e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Ok(parsed) = parse_artifact_name(&file_name) else {
                continue;
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let artifact = match ArtifactManifest::load(&self.backup_dir, &file_name) {
                Ok(Some(manifest)) => manifest.into_artifact(),
                Ok(None) | Err(_) => BackupArtifact {
                    size_bytes: entry.metadata().map(|m| m.len()).unwrap_or(0),
                    file_name,
                    created_at: parsed.created_at,
                    encrypted: parsed.encrypted,
                    description: None,
                    run_type: parsed.run_type,
                    checksum: None,
                },
            };
            artifacts.push(artifact);
        }

        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(artifacts)
    }

    pub fn get(&self, file_name: &str) -> Result<BackupArtifact, BackupError> {
        parse_artifact_name(file_name)?;
        self.list()?
            .into_iter()
            .find(|a| a.file_name == file_name)
            .ok_or_else(|| BackupError::NotFound(file_name.to_string()))
    }

    /// Full path of an allow-listed artifact that exists
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, BackupError> {
        parse_artifact_name(file_name)?;
        let path = self.backup_dir.join(file_name);
        if !path.is_file() {
            return Err(BackupError::NotFound(file_name.to_string()));
        }
        Ok(path)
    }

    /// Remove an artifact and its manifest. The name is checked against the
    /// allow-list before any filesystem call.
    pub fn delete(&self, file_name: &str, actor: Option<&str>) -> Result<(), BackupError> {
        parse_artifact_name(file_name)?;
        let _lock = self.locks.acquire(LockType::Retention)?;

        self.remove_artifact(file_name)?;
        info!(file = file_name, "backup deleted");

        self.audit.record(
            NewAuditEntry::new(AuditAction::BackupDelete, AuditCategory::Backup, "backup")
                .with_actor(actor)
                .with_entity_id(file_name)
                .with_severity(Severity::Warning),
        );
        Ok(())
    }

    /// Evict artifacts ranked at or past `max_count`, or older than
    /// `max_age_days`. The newest artifact always survives.
    pub fn enforce_retention(&self, policy: RetentionPolicy, actor: Option<&str>) -> Result<RetentionReport, BackupError> {
        let _lock = self.locks.acquire(LockType::Retention)?;

        let artifacts = self.list()?;
        let now = Utc::now();
        let max_age = Duration::days(i64::from(policy.max_age_days));
        let mut report = RetentionReport::default();

        for (rank, artifact) in artifacts.iter().enumerate() {
            let over_count = rank >= policy.max_count;
            let over_age = now.signed_duration_since(artifact.created_at) > max_age;

            if rank == 0 || !(over_count || over_age) {
                report.kept.push(artifact.file_name.clone());
                continue;
            }

            match self.remove_artifact(&artifact.file_name) {
                Ok(()) => report.deleted.push(artifact.file_name.clone()),
                Err(e) => {
                    warn!(file = %artifact.file_name, error = %e, "retention could not remove backup");
                    report.failed.push(artifact.file_name.clone());
                }
            }
        }

        info!(
            kept = report.kept.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "retention enforced"
        );

        if !report.deleted.is_empty() || !report.failed.is_empty() {
            self.audit.record(
                NewAuditEntry::new(AuditAction::BackupPrune, AuditCategory::Backup, "backup")
                    .with_actor(actor)
                    .with_severity(if report.failed.is_empty() { Severity::Info } else { Severity::Warning })
                    .with_metadata(serde_json::json!({
                        "max_count": policy.max_count,
                        "max_age_days": policy.max_age_days,
                        "deleted": report.deleted,
                        "failed": report.failed,
                    })),
            );
        }

        Ok(report)
    }

    fn remove_artifact(&self, file_name: &str) -> Result<(), BackupError> {
        let path = self.backup_dir.join(file_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(file_name.to_string()));
            }
            Err(e) => return Err(BackupError::from_io(file_name, e)),
        }
        let manifest = self.backup_dir.join(format!("{}{}", file_name, MANIFEST_SUFFIX));
        if manifest.exists() {
            fs::remove_file(&manifest).map_err(|e| BackupError::from_io(file_name, e))?;
        }
        Ok(())
    }
}

//! Backup Serializer
//!
//! Point-in-time snapshots of the live store, plain or encrypted. Artifacts
//! become visible only through an atomic rename out of a hidden temp file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};

use super::cipher;
use super::runs::{BackupRun, RunLog};
use super::{artifact_name, file_checksum, write_synced, ArtifactManifest, BackupError, RunType, TempFile};
use crate::engine::audit::{AuditAction, AuditCategory, AuditLog, NewAuditEntry, Severity};
use crate::engine::database::Database;
use crate::engine::keystore::InstallationSecrets;
use crate::engine::locks::{LockInfo, LockType, OperationLock};

/// A backup lock older than this is taken over by the next run
const SNAPSHOT_LOCK_TIMEOUT_SECS: u64 = 4 * 3600;

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub run_type: RunType,
    pub description: Option<String>,
    pub actor: Option<String>,
}

impl SnapshotRequest {
    pub fn manual(actor: Option<&str>) -> Self {
        Self {
            run_type: RunType::Manual,
            description: None,
            actor: actor.map(String::from),
        }
    }

    pub fn scheduled() -> Self {
        Self {
            run_type: RunType::Scheduled,
            description: None,
            actor: None,
        }
    }

    pub fn with_description(mut self, description: Option<&str>) -> Self {
        self.description = description.map(String::from);
        self
    }
}

/// A completed artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub file_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Clone)]
pub struct BackupSerializer {
    db: Database,
    audit: AuditLog,
    runs: RunLog,
    locks: OperationLock,
    secrets: InstallationSecrets,
    backup_dir: PathBuf,
}

impl BackupSerializer {
    pub fn new(
        audit: AuditLog,
        locks: OperationLock,
        secrets: InstallationSecrets,
        backup_dir: PathBuf,
    ) -> Self {
        let db = audit.database().clone();
        Self {
            runs: RunLog::new(db.clone()),
            db,
            audit,
            locks,
            secrets,
            backup_dir,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshot the live store into the backup directory.
    ///
    /// Holds the installation backup lock for the whole write. Every attempt
    /// leaves a run-log row and a `BACKUP_CREATE` entry, failures included.
    pub fn create_snapshot(&self, encrypted: bool, request: &SnapshotRequest) -> Result<Snapshot, BackupError> {
        let _lock = self.locks.acquire_with(
            LockInfo::new(LockType::Backup)
                .with_description(&format!(
                    "{} backup in progress",
                    request.run_type.as_str().to_lowercase()
                ))
                .with_timeout(SNAPSHOT_LOCK_TIMEOUT_SECS),
        )?;

        let started = Instant::now();
        let started_at = Utc::now();
        let result = self.write_snapshot(encrypted, started_at, request);

        let mut run = BackupRun::new(started_at, request.run_type);
        run.finished_at = Utc::now();
        run.duration_ms = started.elapsed().as_millis() as u64;

        let entry = NewAuditEntry::new(AuditAction::BackupCreate, AuditCategory::Backup, "backup")
            .with_actor(request.actor.as_deref());

        let entry = match &result {
            Ok(snapshot) => {
                run.success = true;
                run.file_name = Some(snapshot.file_name.clone());
                run.size_bytes = Some(snapshot.size_bytes);
                info!(
                    file = %snapshot.file_name,
                    size = snapshot.size_bytes,
                    encrypted,
                    duration_ms = run.duration_ms,
                    "backup created"
                );
                entry.with_entity_id(&snapshot.file_name).with_metadata(serde_json::json!({
                    "run_type": request.run_type.as_str(),
                    "encrypted": encrypted,
                    "size_bytes": snapshot.size_bytes,
                    "checksum": snapshot.checksum,
                    "duration_ms": run.duration_ms,
                }))
            }
            Err(e) => {
                run.error = Some(e.to_string());
                error!(error = %e, run_type = request.run_type.as_str(), "backup failed");
                entry.with_severity(Severity::Error).with_metadata(serde_json::json!({
                    "run_type": request.run_type.as_str(),
                    "encrypted": encrypted,
                    "error": e.to_string(),
                    "duration_ms": run.duration_ms,
                }))
            }
        };

        if let Err(e) = self.runs.record_backup(&run) {
            error!(error = %e, "failed to record backup run");
        }
        self.audit.record(entry);

        result
    }

    fn write_snapshot(
        &self,
        encrypted: bool,
        created_at: DateTime<Utc>,
        request: &SnapshotRequest,
    ) -> Result<Snapshot, BackupError> {
        // Resolve the secret before anything touches the disk
        let secret = if encrypted {
            Some(self.secrets.backup_secret().ok_or(BackupError::MissingSecret)?)
        } else {
            None
        };

        fs::create_dir_all(&self.backup_dir).map_err(|e| BackupError::from_io("backup directory", e))?;

        let file_name = artifact_name(&created_at, request.run_type, encrypted);
        let final_path = self.backup_dir.join(&file_name);
        if final_path.exists() {
            return Err(BackupError::AlreadyExists(file_name));
        }

        let plain = TempFile::new(self.backup_dir.join(format!(".tmp-{}.plain", file_name)));
        self.db
            .snapshot_into(plain.path())
            .map_err(|e| BackupError::from_db("snapshot", e))?;

        match secret {
            Some(secret) => {
                let bytes = fs::read(plain.path()).map_err(|e| BackupError::from_io("snapshot", e))?;
                let sealed = cipher::encrypt(&bytes, secret)?;
                let staged = TempFile::new(self.backup_dir.join(format!(".tmp-{}", file_name)));
                write_synced(staged.path(), &sealed).map_err(|e| BackupError::from_io("encrypted snapshot", e))?;
                staged
                    .persist(&final_path)
                    .map_err(|e| BackupError::from_io("encrypted snapshot", e))?;
                // `plain` is removed when it drops at the end of this scope
            }
            None => {
                fs::File::open(plain.path())
                    .and_then(|f| f.sync_all())
                    .map_err(|e| BackupError::from_io("snapshot", e))?;
                plain
                    .persist(&final_path)
                    .map_err(|e| BackupError::from_io("snapshot", e))?;
            }
        }

        let published = || -> Result<Snapshot, BackupError> {
            let size_bytes = fs::metadata(&final_path)?.len();
            let checksum = file_checksum(&final_path)?;

            ArtifactManifest {
                file_name: file_name.clone(),
                created_at,
                size_bytes,
                encrypted,
                description: request.description.clone(),
                run_type: request.run_type,
                checksum: checksum.clone(),
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            }
            .save(&self.backup_dir)?;

            Ok(Snapshot {
                file_path: final_path.clone(),
                file_name: file_name.clone(),
                size_bytes,
                encrypted,
                created_at,
                checksum,
            })
        };

        // An artifact without a manifest cannot be verified at restore time
        published().inspect_err(|_| {
            let _ = fs::remove_file(&final_path);
        })
    }

    pub fn runs(&self) -> &RunLog {
        &self.runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backup::parse_artifact_name;
    use crate::engine::database::structural_check;
    use tempfile::tempdir;

    fn serializer(dir: &Path, secrets: InstallationSecrets) -> BackupSerializer {
        let db = Database::new(&dir.join("data").join("live.db")).unwrap();
        db.get_connection()
            .unwrap()
            .execute_batch(
                "CREATE TABLE patients (id TEXT PRIMARY KEY, name TEXT);
                 INSERT INTO patients VALUES ('p-1', 'Ada');",
            )
            .unwrap();
        BackupSerializer::new(
            AuditLog::new(db),
            OperationLock::new(dir),
            secrets,
            dir.join("backups"),
        )
    }

    fn visible_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_plain_snapshot() {
        let dir = tempdir().unwrap();
        let s = serializer(dir.path(), InstallationSecrets::default());

        let snap = s.create_snapshot(false, &SnapshotRequest::manual(Some("admin"))).unwrap();
        assert!(!snap.encrypted);
        assert!(parse_artifact_name(&snap.file_name).is_ok());
        structural_check(&snap.file_path).unwrap();
        assert_eq!(snap.checksum, file_checksum(&snap.file_path).unwrap());

        // Artifact and manifest only, no temp leftovers
        let files = visible_files(s.backup_dir());
        assert_eq!(files, vec![snap.file_name.clone(), format!("{}.meta.json", snap.file_name)]);

        let runs = s.runs().recent_backups(5).unwrap();
        assert!(runs[0].success);
        assert_eq!(runs[0].file_name.as_deref(), Some(snap.file_name.as_str()));

        let last = s.audit.last_entry().unwrap().unwrap();
        assert_eq!(last.action, AuditAction::BackupCreate);
        assert_eq!(last.actor_id.as_deref(), Some("admin"));
    }

    #[test]
    fn test_encrypted_snapshot_decrypts_to_store() {
        let dir = tempdir().unwrap();
        let secrets = InstallationSecrets::new(Some("installation-secret"), None);
        let s = serializer(dir.path(), secrets.clone());

        let snap = s.create_snapshot(true, &SnapshotRequest::scheduled()).unwrap();
        assert!(snap.file_name.ends_with(".db.enc"));
        let sealed = fs::read(&snap.file_path).unwrap();
        assert!(cipher::is_encrypted(&sealed));

        let restored = dir.path().join("decrypted.db");
        cipher::decrypt_file(&snap.file_path, &restored, secrets.backup_secret().unwrap()).unwrap();
        structural_check(&restored).unwrap();
        let name: String = rusqlite::Connection::open(&restored)
            .unwrap()
            .query_row("SELECT name FROM patients WHERE id = 'p-1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Ada");

        assert_eq!(visible_files(s.backup_dir()).len(), 2);
    }

    #[test]
    fn test_missing_secret_leaves_nothing() {
        let dir = tempdir().unwrap();
        let s = serializer(dir.path(), InstallationSecrets::default());

        let result = s.create_snapshot(true, &SnapshotRequest::manual(None));
        assert!(matches!(result, Err(BackupError::MissingSecret)));
        assert!(!s.backup_dir().exists() || visible_files(s.backup_dir()).is_empty());

        // The failed attempt is still on record
        let runs = s.runs().recent_backups(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].success);
        let last = s.audit.last_entry().unwrap().unwrap();
        assert_eq!(last.severity, Severity::Error);
    }

    #[test]
    fn test_backup_refused_during_restore() {
        let dir = tempdir().unwrap();
        let s = serializer(dir.path(), InstallationSecrets::default());
        let _restore = OperationLock::new(dir.path()).acquire(LockType::Restore).unwrap();

        let result = s.create_snapshot(false, &SnapshotRequest::manual(None));
        assert!(matches!(result, Err(BackupError::Locked(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_denied_is_classified() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let s = serializer(dir.path(), InstallationSecrets::default());
        fs::create_dir_all(s.backup_dir()).unwrap();
        fs::set_permissions(s.backup_dir(), fs::Permissions::from_mode(0o500)).unwrap();

        // Root ignores directory permissions
        let probe = s.backup_dir().join("probe");
        if fs::write(&probe, b"").is_ok() {
            let _ = fs::remove_file(&probe);
            return;
        }

        let result = s.create_snapshot(false, &SnapshotRequest::manual(None));
        fs::set_permissions(s.backup_dir(), fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(
            result,
            Err(BackupError::PermissionDenied(_)) | Err(BackupError::Unavailable(_))
        ));
        assert!(visible_files(s.backup_dir()).is_empty());
    }
}

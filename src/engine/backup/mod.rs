//! Backup/Restore Pipeline: snapshot artifacts
//!
//! Serializer, catalog, cipher and run log for backup files

pub mod catalog;
pub mod cipher;
pub mod location;
pub mod runs;
pub mod serializer;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::engine::database::DatabaseError;
use crate::engine::locks::LockError;

pub use catalog::{BackupCatalog, RetentionPolicy, RetentionReport};
pub use location::{detect_location, DetectedLocation, LocationSource};
pub use runs::{BackupRun, RecoveryOutcome, RecoveryTest, RunLog};
pub use serializer::{BackupSerializer, Snapshot, SnapshotRequest};

pub const ARTIFACT_PREFIX: &str = "carelog-backup-";
pub const MANIFEST_SUFFIX: &str = ".meta.json";
const ENCRYPTED_SUFFIX: &str = ".enc";

// Linux/macOS ENOSPC, Windows ERROR_HANDLE_DISK_FULL / ERROR_DISK_FULL
const DISK_FULL_CODES: &[i32] = &[28, 39, 112];

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup name: {0}")]
    InvalidName(String),
    #[error("Backup not found: {0}")]
    NotFound(String),
    #[error("Backup already exists: {0}")]
    AlreadyExists(String),
    #[error("Disk full while writing {0}")]
    DiskFull(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Live store busy: {0}")]
    SourceBusy(String),
    #[error("Backup location unavailable: {0}")]
    Unavailable(String),
    #[error("Backup secret is not configured")]
    MissingSecret,
    #[error("Decryption failed: wrong backup secret or damaged file")]
    DecryptionFailed,
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("Backup verification failed: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Locked(#[from] LockError),
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(DatabaseError),
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl BackupError {
    /// Sort an IO failure into the reasons an operator can act on
    pub fn from_io(context: &str, e: io::Error) -> Self {
        if e.raw_os_error().map(|c| DISK_FULL_CODES.contains(&c)).unwrap_or(false) {
            return BackupError::DiskFull(context.to_string());
        }
        match e.kind() {
            io::ErrorKind::PermissionDenied => BackupError::PermissionDenied(context.to_string()),
            io::ErrorKind::NotFound => BackupError::Unavailable(context.to_string()),
            _ => BackupError::Io(e),
        }
    }

    pub fn from_db(context: &str, e: DatabaseError) -> Self {
        use rusqlite::ErrorCode;

        match e {
            DatabaseError::SqliteError(rusqlite::Error::SqliteFailure(failure, message)) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    BackupError::SourceBusy(context.to_string())
                }
                ErrorCode::DiskFull => BackupError::DiskFull(context.to_string()),
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    BackupError::PermissionDenied(context.to_string())
                }
                ErrorCode::CannotOpen => BackupError::Unavailable(context.to_string()),
                _ => BackupError::Database(DatabaseError::SqliteError(rusqlite::Error::SqliteFailure(
                    failure, message,
                ))),
            },
            DatabaseError::PoolError(_) => BackupError::SourceBusy(context.to_string()),
            DatabaseError::IoError(io_err) => BackupError::from_io(context, io_err),
            other => BackupError::Database(other),
        }
    }
}

impl From<io::Error> for BackupError {
    fn from(e: io::Error) -> Self {
        BackupError::from_io("backup file", e)
    }
}

impl From<DatabaseError> for BackupError {
    fn from(e: DatabaseError) -> Self {
        BackupError::from_db("live store", e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    Manual,
    Scheduled,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Manual => "MANUAL",
            RunType::Scheduled => "SCHEDULED",
        }
    }

    fn name_tag(&self) -> &'static str {
        match self {
            RunType::Manual => "manual",
            RunType::Scheduled => "scheduled",
        }
    }
}

/// A snapshot file as listed by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub encrypted: bool,
    pub description: Option<String>,
    pub run_type: RunType,
    /// SHA-256 of the artifact bytes, when a manifest exists
    pub checksum: Option<String>,
}

/// Sidecar metadata written next to each artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub encrypted: bool,
    pub description: Option<String>,
    pub run_type: RunType,
    pub checksum: String,
    pub app_version: String,
}

impl ArtifactManifest {
    pub fn path_for(backup_dir: &Path, file_name: &str) -> PathBuf {
        backup_dir.join(format!("{}{}", file_name, MANIFEST_SUFFIX))
    }

    pub fn load(backup_dir: &Path, file_name: &str) -> Result<Option<Self>, BackupError> {
        let path = Self::path_for(backup_dir, file_name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Atomic write: temp file, then rename
    pub fn save(&self, backup_dir: &Path) -> Result<(), BackupError> {
        let path = Self::path_for(backup_dir, &self.file_name);
        let tmp = backup_dir.join(format!(".tmp-{}{}", self.file_name, MANIFEST_SUFFIX));
        let content = serde_json::to_string_pretty(self)?;
        write_synced(&tmp, content.as_bytes()).map_err(|e| BackupError::from_io("manifest", e))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            BackupError::from_io("manifest", e)
        })?;
        Ok(())
    }

    pub fn into_artifact(self) -> BackupArtifact {
        BackupArtifact {
            file_name: self.file_name,
            created_at: self.created_at,
            size_bytes: self.size_bytes,
            encrypted: self.encrypted,
            description: self.description,
            run_type: self.run_type,
            checksum: Some(self.checksum),
        }
    }
}

fn artifact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^carelog-backup-(\d{8}T\d{6})(\d{3})Z-(manual|scheduled)\.db(\.enc)?$")
            .expect("artifact pattern is a valid regex")
    })
}

/// Fields recoverable from an allow-listed artifact name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub created_at: DateTime<Utc>,
    pub run_type: RunType,
    pub encrypted: bool,
}

/// Strict allow-list check. Runs before any filesystem call that takes an
/// externally supplied name.
pub fn parse_artifact_name(file_name: &str) -> Result<ParsedName, BackupError> {
    let invalid = || BackupError::InvalidName(file_name.to_string());
    let caps = artifact_pattern().captures(file_name).ok_or_else(invalid)?;

    let seconds = NaiveDateTime::parse_from_str(&caps[1], "%Y%m%dT%H%M%S").map_err(|_| invalid())?;
    let millis: i64 = caps[2].parse().map_err(|_| invalid())?;
    let created_at = (seconds + chrono::Duration::milliseconds(millis)).and_utc();

    let run_type = match &caps[3] {
        "scheduled" => RunType::Scheduled,
        _ => RunType::Manual,
    };

    Ok(ParsedName {
        created_at,
        run_type,
        encrypted: caps.get(4).is_some(),
    })
}

/// Sortable, timestamp-derived artifact name
pub fn artifact_name(created_at: &DateTime<Utc>, run_type: RunType, encrypted: bool) -> String {
    format!(
        "{}{}Z-{}.db{}",
        ARTIFACT_PREFIX,
        created_at.format("%Y%m%dT%H%M%S%3f"),
        run_type.name_tag(),
        if encrypted { ENCRYPTED_SUFFIX } else { "" }
    )
}

/// SHA-256 of a file's contents, hex-encoded
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write and fsync, so a rename afterwards publishes complete bytes
pub(crate) fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Removes its path on drop unless the file was moved away
pub(crate) struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        // Leftover from a crashed run
        let _ = fs::remove_file(&path);
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into place; the guard no longer owns anything afterwards
    pub fn persist(self, dest: &Path) -> io::Result<()> {
        fs::rename(&self.path, dest)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_round_trip() {
        let created = Utc.with_ymd_and_hms(2026, 10, 14, 9, 5, 7).unwrap() + chrono::Duration::milliseconds(42);
        let name = artifact_name(&created, RunType::Scheduled, true);
        assert_eq!(name, "carelog-backup-20261014T090507042Z-scheduled.db.enc");

        let parsed = parse_artifact_name(&name).unwrap();
        assert_eq!(parsed.created_at, created);
        assert_eq!(parsed.run_type, RunType::Scheduled);
        assert!(parsed.encrypted);
    }

    #[test]
    fn test_names_sort_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(artifact_name(&a, RunType::Manual, false) < artifact_name(&b, RunType::Manual, false));
    }

    #[test]
    fn test_allow_list_rejects_traversal() {
        for name in [
            "../../etc/passwd",
            "..%2fsecret",
            "carelog-backup-20261014T090507042Z-manual.db/../../x",
            "carelog-backup-20261014T090507042Z-manual.db.meta.json",
            ".tmp-carelog-backup-20261014T090507042Z-manual.db",
            "carelog-backup-20261014T090507042Z-manual.sqlite",
            "",
        ] {
            assert!(
                matches!(parse_artifact_name(name), Err(BackupError::InvalidName(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_io_classification() {
        let full = io::Error::from_raw_os_error(28);
        assert!(matches!(BackupError::from_io("x", full), BackupError::DiskFull(_)));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(BackupError::from_io("x", denied), BackupError::PermissionDenied(_)));

        let gone = io::Error::new(io::ErrorKind::NotFound, "unmounted");
        assert!(matches!(BackupError::from_io("x", gone), BackupError::Unavailable(_)));
    }

    #[test]
    fn test_temp_file_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tmp-x");
        {
            let tmp = TempFile::new(path.clone());
            fs::write(tmp.path(), b"plaintext").unwrap();
        }
        assert!(!path.exists());

        let tmp = TempFile::new(path.clone());
        fs::write(tmp.path(), b"kept").unwrap();
        let dest = dir.path().join("final");
        tmp.persist(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"kept");
    }
}

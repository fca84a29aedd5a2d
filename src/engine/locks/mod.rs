//! Operation Lock System
//!
//! Installation-wide mutual exclusion between backup, restore and retention
//! runs. Shared by the cron trigger, admin requests and other processes.

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

/// Lock types for subsystem operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Backup,
    Restore,
    Retention,
}

impl LockType {
    pub const ALL: [LockType; 3] = [LockType::Backup, LockType::Restore, LockType::Retention];

    pub fn filename(&self) -> &'static str {
        match self {
            LockType::Backup => "backup.lock",
            LockType::Restore => "restore.lock",
            LockType::Retention => "retention.lock",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LockType::Backup => "Backup operation in progress",
            LockType::Restore => "Restore operation in progress",
            LockType::Retention => "Retention pruning in progress",
        }
    }

    /// Lock types that must not be held while this one is acquired
    fn blocked_by(&self) -> &'static [LockType] {
        match self {
            LockType::Backup => &[LockType::Restore],
            LockType::Restore => &[LockType::Backup, LockType::Retention],
            LockType::Retention => &[LockType::Restore],
        }
    }
}

/// Information stored in a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_type: LockType,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
    pub timeout_secs: Option<u64>,
}

impl LockInfo {
    pub fn new(lock_type: LockType) -> Self {
        Self {
            lock_type,
            pid: std::process::id(),
            started_at: Utc::now(),
            description: lock_type.description().to_string(),
            timeout_secs: None,
        }
    }

    /// Treat the lock as abandoned `secs` after it was taken
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_description(mut self, desc: &str) -> Self {
        self.description = desc.to_string();
        self
    }

    /// Check if lock has expired
    pub fn is_expired(&self) -> bool {
        if let Some(timeout) = self.timeout_secs {
            let elapsed = Utc::now().signed_duration_since(self.started_at);
            elapsed.num_seconds() as u64 > timeout
        } else {
            false
        }
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }

        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }

    fn is_live(&self) -> bool {
        self.is_process_alive() && !self.is_expired()
    }
}

/// Lock errors
#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("{lock_type:?} lock held by PID {pid}: {description}. Retry later.")]
    AlreadyLocked {
        lock_type: LockType,
        pid: u32,
        description: String,
    },
    #[error("Cannot acquire {requested:?} lock: blocked by {blocking:?} ({description}). Retry later.")]
    BlockedBy {
        requested: LockType,
        blocking: LockType,
        description: String,
    },
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}

/// Operation lock manager
#[derive(Debug, Clone)]
pub struct OperationLock {
    locks_dir: PathBuf,
}

impl OperationLock {
    /// Lock manager rooted at an installation's data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            locks_dir: data_dir.join(".carelog").join("locks"),
        }
    }

    fn lock_path(&self, lock_type: LockType) -> PathBuf {
        self.locks_dir.join(lock_type.filename())
    }

    /// Acquire a lock without waiting. A held or blocking lock is an error,
    /// never a queue.
    pub fn acquire(&self, lock_type: LockType) -> Result<LockGuard, LockError> {
        self.acquire_with(LockInfo::new(lock_type))
    }

    pub fn acquire_with(&self, info: LockInfo) -> Result<LockGuard, LockError> {
        let lock_type = info.lock_type;
        fs::create_dir_all(&self.locks_dir).map_err(|e| LockError::IoError(e.to_string()))?;

        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| LockError::SerializeError(e.to_string()))?;
        let lock_path = self.lock_path(lock_type);

        // Publish first, then look for blockers. Two conflicting acquirers
        // each see the other's file, so at most one of them proceeds.
        let mut file = match self.create_lock_file(lock_type, &lock_path)? {
            Some(file) => file,
            None => {
                warn!(?lock_type, "removing stale lock");
                let _ = fs::remove_file(&lock_path);
                self.create_lock_file(lock_type, &lock_path)?
                    .ok_or_else(|| LockError::IoError(format!("{} reappeared", lock_path.display())))?
            }
        };
        let guard = LockGuard {
            lock_path,
            lock_type,
        };

        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| LockError::IoError(e.to_string()))?;
        drop(file);

        self.check_blocking_locks(lock_type)?;

        debug!(?lock_type, "lock acquired");
        Ok(guard)
    }

    /// `Ok(None)` means the path is taken by a stale lock the caller may remove
    fn create_lock_file(&self, lock_type: LockType, lock_path: &Path) -> Result<Option<fs::File>, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match read_lock(lock_path) {
                LockFile::Missing => Ok(None),
                LockFile::Written(existing) if !existing.is_live() => {
                    debug!(?lock_type, pid = existing.pid, "lock holder gone");
                    Ok(None)
                }
                LockFile::Partial { fresh: false } => Ok(None),
                held => Err(LockError::AlreadyLocked {
                    lock_type,
                    pid: held.pid(),
                    description: held.description(lock_type),
                }),
            },
            Err(e) => Err(LockError::IoError(e.to_string())),
        }
    }

    fn check_blocking_locks(&self, requested: LockType) -> Result<(), LockError> {
        for &lock_type in requested.blocked_by() {
            let found = read_lock(&self.lock_path(lock_type));
            if found.is_held() {
                return Err(LockError::BlockedBy {
                    requested,
                    blocking: lock_type,
                    description: found.description(lock_type),
                });
            }
        }
        Ok(())
    }

    /// Locks currently held by live processes
    pub fn get_active_locks(&self) -> Vec<LockInfo> {
        LockType::ALL
            .iter()
            .filter_map(|&lock_type| match read_lock(&self.lock_path(lock_type)) {
                LockFile::Written(info) if info.is_live() => Some(info),
                _ => None,
            })
            .collect()
    }
}

/// How long a lock file may stay empty or unparseable before it counts as
/// abandoned by a writer that died mid-publish
const PARTIAL_LOCK_GRACE: Duration = Duration::from_secs(30);

/// What sits at a lock path
#[derive(Debug)]
enum LockFile {
    Missing,
    /// Present but without a readable record yet
    Partial { fresh: bool },
    Written(LockInfo),
}

impl LockFile {
    fn is_held(&self) -> bool {
        match self {
            LockFile::Missing => false,
            LockFile::Partial { fresh } => *fresh,
            LockFile::Written(info) => info.is_live(),
        }
    }

    fn pid(&self) -> u32 {
        match self {
            LockFile::Written(info) => info.pid,
            _ => 0,
        }
    }

    fn description(&self, lock_type: LockType) -> String {
        match self {
            LockFile::Written(info) => info.description.clone(),
            _ => lock_type.description().to_string(),
        }
    }
}

fn read_lock(path: &Path) -> LockFile {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LockFile::Missing,
        Err(_) => return LockFile::Partial { fresh: true },
    };
    match serde_json::from_str(&content) {
        Ok(info) => LockFile::Written(info),
        Err(_) => {
            let fresh = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map(|age| age < PARTIAL_LOCK_GRACE)
                .unwrap_or(true);
            LockFile::Partial { fresh }
        }
    }
}

/// RAII guard that releases lock on drop
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    lock_type: LockType,
}

impl LockGuard {
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::SystemTime;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_release() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let guard = locks.acquire(LockType::Backup).unwrap();
        assert_eq!(guard.lock_type(), LockType::Backup);

        // Can't acquire same lock twice
        assert!(matches!(
            locks.acquire(LockType::Backup),
            Err(LockError::AlreadyLocked { .. })
        ));

        drop(guard);

        // Can acquire after release
        assert!(locks.acquire(LockType::Backup).is_ok());
    }

    #[test]
    fn test_backup_and_restore_exclude_each_other() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let backup = locks.acquire(LockType::Backup).unwrap();
        assert!(matches!(
            locks.acquire(LockType::Restore),
            Err(LockError::BlockedBy { blocking: LockType::Backup, .. })
        ));
        drop(backup);

        let _restore = locks.acquire(LockType::Restore).unwrap();
        assert!(matches!(
            locks.acquire(LockType::Backup),
            Err(LockError::BlockedBy { blocking: LockType::Restore, .. })
        ));
        assert!(locks.acquire(LockType::Retention).is_err());
    }

    #[test]
    fn test_backup_and_retention_coexist() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        let _backup = locks.acquire(LockType::Backup).unwrap();
        assert!(locks.acquire(LockType::Retention).is_ok());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        fs::create_dir_all(&locks.locks_dir).unwrap();

        let mut stale = LockInfo::new(LockType::Backup);
        stale.timeout_secs = Some(0);
        stale.started_at = Utc::now() - chrono::Duration::seconds(60);
        fs::write(
            locks.lock_path(LockType::Backup),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(locks.get_active_locks().is_empty());
        assert!(locks.acquire(LockType::Backup).is_ok());
    }

    #[test]
    fn test_get_active_locks() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        assert!(locks.get_active_locks().is_empty());

        let _guard = locks.acquire(LockType::Restore).unwrap();

        let active = locks.get_active_locks();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].lock_type, LockType::Restore);
    }

    #[test]
    fn test_conflicting_acquirers_never_both_win() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());

        for (first, second) in [
            (LockType::Backup, LockType::Restore),
            (LockType::Retention, LockType::Restore),
        ] {
            for _ in 0..200 {
                let barrier = Barrier::new(2);
                let (a, b) = thread::scope(|s| {
                    let a = s.spawn(|| {
                        barrier.wait();
                        locks.acquire(first)
                    });
                    let b = s.spawn(|| {
                        barrier.wait();
                        locks.acquire(second)
                    });
                    (a.join().unwrap(), b.join().unwrap())
                });
                assert!(
                    !(a.is_ok() && b.is_ok()),
                    "{:?} and {:?} held at the same time",
                    first,
                    second
                );
            }
            // Nothing leaks from the losing side
            assert!(locks.get_active_locks().is_empty());
            assert!(locks.acquire(second).is_ok());
        }
    }

    #[test]
    fn test_unwritten_lock_file_counts_as_held() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        fs::create_dir_all(&locks.locks_dir).unwrap();
        fs::write(locks.lock_path(LockType::Backup), b"").unwrap();

        assert!(matches!(
            locks.acquire(LockType::Restore),
            Err(LockError::BlockedBy { blocking: LockType::Backup, .. })
        ));
        assert!(matches!(
            locks.acquire(LockType::Backup),
            Err(LockError::AlreadyLocked { .. })
        ));
    }

    #[test]
    fn test_abandoned_partial_lock_expires() {
        let dir = tempdir().unwrap();
        let locks = OperationLock::new(dir.path());
        fs::create_dir_all(&locks.locks_dir).unwrap();
        let path = locks.lock_path(LockType::Backup);
        fs::write(&path, b"{\"lock_type\":").unwrap();
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(120))
            .unwrap();

        assert!(locks.acquire(LockType::Restore).is_ok());
    }

    #[test]
    fn test_lock_timeout() {
        let mut info = LockInfo::new(LockType::Backup).with_timeout(3600);
        assert!(info.is_live());
        info.started_at = Utc::now() - chrono::Duration::hours(2);
        assert!(info.is_expired());
    }
}

//! CareLog Live Store
//! SQLite adapter with connection pooling

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Database file not found: {0}")]
    NotFound(String),
    #[error("Structural check failed: {0}")]
    Corrupt(String),
    #[error("Database handle poisoned")]
    Poisoned,
}

/// Handle to the live store.
///
/// The pool sits behind a lock so a restore can suspend new checkouts while it
/// swaps the file, then rebuild the pool against whatever file is live.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
    pool: Arc<RwLock<DbPool>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = build_pool(db_path)?;
        let db = Self {
            path: db_path.to_path_buf(),
            pool: Arc::new(RwLock::new(pool)),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.get_connection()?;
        init_schema(&conn)
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        let pool = self
            .pool
            .read()
            .map_err(|_| DatabaseError::Poisoned)?
            .clone();
        Ok(pool.get()?)
    }

    /// Blocks new connection checkouts until the returned guard is dropped.
    ///
    /// Connections checked out before the call are not drained. They stay
    /// usable and keep writing to whichever file they opened, so a write
    /// in flight during a swap lands in the quarantined store. Audit appends
    /// are held off with `AuditLog::pause_appends`; other writers must not
    /// hold a connection across a restore.
    pub fn exclusive(&self) -> Result<ExclusiveAccess<'_>, DatabaseError> {
        let guard = self.pool.write().map_err(|_| DatabaseError::Poisoned)?;
        Ok(ExclusiveAccess {
            path: &self.path,
            guard,
        })
    }

    /// Point-in-time copy of the whole store into `dest`.
    pub fn snapshot_into(&self, dest: &Path) -> Result<(), DatabaseError> {
        let conn = self.get_connection()?;
        let dest = dest.to_string_lossy().to_string();
        conn.execute("VACUUM INTO ?1", [dest])?;
        Ok(())
    }
}

/// Write access to the pool slot, held for the duration of a store swap
pub struct ExclusiveAccess<'a> {
    path: &'a Path,
    guard: RwLockWriteGuard<'a, DbPool>,
}

impl ExclusiveAccess<'_> {
    /// Replace the pool with one opened against the file now at the live path
    pub fn reconnect(&mut self) -> Result<(), DatabaseError> {
        *self.guard = build_pool(self.path)?;
        Ok(())
    }
}

fn build_pool(db_path: &Path) -> Result<DbPool, DatabaseError> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Rollback journal keeps the store a single file, so a restore can
        // swap it with one rename.
        let _: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=FULL;")
    });
    Ok(Pool::builder().max_size(10).build(manager)?)
}

fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            timestamp TEXT NOT NULL,
            actor_id TEXT,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            category TEXT NOT NULL,
            severity TEXT NOT NULL,
            ip_address TEXT,
            user_agent TEXT,
            metadata TEXT NOT NULL,
            prev_checksum TEXT NOT NULL UNIQUE,
            checksum TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_log(actor_id);
        CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);

        CREATE TABLE IF NOT EXISTS audit_anchor (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_pruned_seq INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            pruned_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS backup_runs (
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            run_type TEXT NOT NULL,
            success INTEGER NOT NULL,
            file_name TEXT,
            size_bytes INTEGER,
            duration_ms INTEGER NOT NULL,
            error TEXT
        );

        CREATE TABLE IF NOT EXISTS recovery_tests (
            id TEXT PRIMARY KEY,
            artifact TEXT NOT NULL,
            started_at TEXT NOT NULL,
            outcome TEXT NOT NULL,
            rpo_seconds INTEGER NOT NULL,
            rto_ms INTEGER NOT NULL,
            error TEXT
        );",
    )?;
    Ok(())
}

/// Cheap header probe used before trusting a file as a store candidate
pub fn is_sqlite_file(path: &Path) -> Result<bool, DatabaseError> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(&header == SQLITE_HEADER),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Minimal structural check: the file opens, passes `PRAGMA integrity_check`
/// and carries the audit log table.
pub fn structural_check(path: &Path) -> Result<(), DatabaseError> {
    if !path.exists() {
        return Err(DatabaseError::NotFound(path.display().to_string()));
    }
    if !is_sqlite_file(path)? {
        return Err(DatabaseError::Corrupt("not a SQLite database".into()));
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(DatabaseError::Corrupt(verdict));
    }

    let tables: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='audit_log'",
        [],
        |row| row.get(0),
    )?;
    if tables == 0 {
        return Err(DatabaseError::Corrupt("audit_log table missing".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_snapshot_passes_structural_check() {
        let dir = tempdir().unwrap();
        let db = Database::new(&dir.path().join("live.db")).unwrap();

        let snapshot = dir.path().join("snap.db");
        db.snapshot_into(&snapshot).unwrap();

        assert!(is_sqlite_file(&snapshot).unwrap());
        structural_check(&snapshot).unwrap();
    }

    #[test]
    fn test_structural_check_rejects_garbage() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("bogus.db");
        std::fs::write(&bogus, b"definitely not sqlite").unwrap();

        assert!(!is_sqlite_file(&bogus).unwrap());
        assert!(matches!(structural_check(&bogus), Err(DatabaseError::Corrupt(_))));
    }

    #[test]
    fn test_structural_check_requires_audit_table() {
        let dir = tempdir().unwrap();
        let other = dir.path().join("other.db");
        let conn = Connection::open(&other).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        drop(conn);

        assert!(matches!(structural_check(&other), Err(DatabaseError::Corrupt(_))));
    }

    #[test]
    fn test_reconnect_follows_live_path() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("live.db");
        let db = Database::new(&live).unwrap();
        db.get_connection()
            .unwrap()
            .execute_batch("CREATE TABLE marker (v TEXT); INSERT INTO marker VALUES ('a');")
            .unwrap();

        let other = dir.path().join("other.db");
        db.snapshot_into(&other).unwrap();
        Connection::open(&other)
            .unwrap()
            .execute("UPDATE marker SET v = 'b'", [])
            .unwrap();

        {
            let mut access = db.exclusive().unwrap();
            std::fs::rename(&live, dir.path().join("old.db")).unwrap();
            std::fs::rename(&other, &live).unwrap();
            access.reconnect().unwrap();
        }

        let v: String = db
            .get_connection()
            .unwrap()
            .query_row("SELECT v FROM marker", [], |row| row.get(0))
            .unwrap();
        assert_eq!(v, "b");
    }
}

//! Operational records for backup runs and restore drills.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BackupError, RunType};
use crate::engine::audit::format_timestamp;
use crate::engine::database::Database;

/// One backup attempt, successful or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_type: RunType,
    pub success: bool,
    pub file_name: Option<String>,
    pub size_bytes: Option<u64>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl BackupRun {
    pub fn new(started_at: DateTime<Utc>, run_type: RunType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at,
            finished_at: started_at,
            run_type,
            success: false,
            file_name: None,
            size_bytes: None,
            duration_ms: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryOutcome {
    Committed,
    RolledBack,
    Failed,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Committed => "COMMITTED",
            RecoveryOutcome::RolledBack => "ROLLED_BACK",
            RecoveryOutcome::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "COMMITTED" => RecoveryOutcome::Committed,
            "ROLLED_BACK" => RecoveryOutcome::RolledBack,
            _ => RecoveryOutcome::Failed,
        }
    }
}

/// A restore attempt with its measured recovery objectives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryTest {
    pub id: String,
    pub artifact: String,
    pub started_at: DateTime<Utc>,
    pub outcome: RecoveryOutcome,
    /// Age of the artifact when the restore began
    pub rpo_seconds: i64,
    /// Wall time of the restore, start to terminal state
    pub rto_ms: u64,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct RunLog {
    db: Database,
}

impl RunLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn record_backup(&self, run: &BackupRun) -> Result<(), BackupError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO backup_runs (id, started_at, finished_at, run_type, success, file_name,
                size_bytes, duration_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                format_timestamp(&run.started_at),
                format_timestamp(&run.finished_at),
                run.run_type.as_str(),
                run.success,
                run.file_name,
                run.size_bytes.map(|s| s as i64),
                run.duration_ms as i64,
                run.error,
            ],
        )
        .map_err(|e| BackupError::Database(e.into()))?;
        Ok(())
    }

    /// Newest first
    pub fn recent_backups(&self, limit: usize) -> Result<Vec<BackupRun>, BackupError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, started_at, finished_at, run_type, success, file_name, size_bytes,
                    duration_ms, error
                 FROM backup_runs ORDER BY started_at DESC LIMIT ?1",
            )
            .map_err(|e| BackupError::Database(e.into()))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                let run_type: String = row.get(3)?;
                Ok(BackupRun {
                    id: row.get(0)?,
                    started_at: parse_ts(row.get::<_, String>(1)?),
                    finished_at: parse_ts(row.get::<_, String>(2)?),
                    run_type: if run_type == "SCHEDULED" { RunType::Scheduled } else { RunType::Manual },
                    success: row.get(4)?,
                    file_name: row.get(5)?,
                    size_bytes: row.get::<_, Option<i64>>(6)?.map(|s| s as u64),
                    duration_ms: row.get::<_, i64>(7)? as u64,
                    error: row.get(8)?,
                })
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| BackupError::Database(e.into()))?;
        Ok(rows)
    }

    pub fn record_recovery_test(&self, test: &RecoveryTest) -> Result<(), BackupError> {
        let conn = self.db.get_connection()?;
        conn.execute(
            "INSERT INTO recovery_tests (id, artifact, started_at, outcome, rpo_seconds, rto_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                test.id,
                test.artifact,
                format_timestamp(&test.started_at),
                test.outcome.as_str(),
                test.rpo_seconds,
                test.rto_ms as i64,
                test.error,
            ],
        )
        .map_err(|e| BackupError::Database(e.into()))?;
        Ok(())
    }

    /// Newest first
    pub fn recovery_tests(&self, limit: usize) -> Result<Vec<RecoveryTest>, BackupError> {
        let conn = self.db.get_connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, artifact, started_at, outcome, rpo_seconds, rto_ms, error
                 FROM recovery_tests ORDER BY started_at DESC LIMIT ?1",
            )
            .map_err(|e| BackupError::Database(e.into()))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(RecoveryTest {
                    id: row.get(0)?,
                    artifact: row.get(1)?,
                    started_at: parse_ts(row.get::<_, String>(2)?),
                    outcome: RecoveryOutcome::parse(&row.get::<_, String>(3)?),
                    rpo_seconds: row.get(4)?,
                    rto_ms: row.get::<_, i64>(5)? as u64,
                    error: row.get(6)?,
                })
            })
            .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
            .map_err(|e| BackupError::Database(e.into()))?;
        Ok(rows)
    }
}

fn parse_ts(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_backup_runs_newest_first() {
        let dir = tempdir().unwrap();
        let runs = RunLog::new(Database::new(&dir.path().join("live.db")).unwrap());

        let earlier = Utc::now() - chrono::Duration::hours(1);
        let mut failed = BackupRun::new(earlier, RunType::Scheduled);
        failed.error = Some("Disk full while writing snapshot".into());
        runs.record_backup(&failed).unwrap();

        let mut ok = BackupRun::new(Utc::now(), RunType::Manual);
        ok.success = true;
        ok.file_name = Some("carelog-backup-20261014T090507042Z-manual.db".into());
        ok.size_bytes = Some(4096);
        runs.record_backup(&ok).unwrap();

        let recent = runs.recent_backups(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].success);
        assert_eq!(recent[0].size_bytes, Some(4096));
        assert_eq!(recent[1].run_type, RunType::Scheduled);
        assert!(recent[1].error.as_deref().unwrap().contains("Disk full"));
    }

    #[test]
    fn test_recovery_tests_persist() {
        let dir = tempdir().unwrap();
        let runs = RunLog::new(Database::new(&dir.path().join("live.db")).unwrap());

        runs.record_recovery_test(&RecoveryTest {
            id: Uuid::new_v4().to_string(),
            artifact: "carelog-backup-20261014T090507042Z-manual.db".into(),
            started_at: Utc::now(),
            outcome: RecoveryOutcome::RolledBack,
            rpo_seconds: 3600,
            rto_ms: 250,
            error: Some("verification failed".into()),
        })
        .unwrap();

        let tests = runs.recovery_tests(5).unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].outcome, RecoveryOutcome::RolledBack);
        assert_eq!(tests[0].rpo_seconds, 3600);
    }
}

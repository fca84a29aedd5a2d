//! One CareLog installation, opened from its directory.
//!
//! Opening resolves any interrupted restore before the live store is touched,
//! then wires the audit log, backup pipeline and restore orchestrator to the
//! same store, locks and secrets.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::engine::audit::{AuditError, AuditLog, IntegrityVerifier};
use crate::engine::backup::{
    BackupCatalog, BackupError, BackupRun, BackupSerializer, RetentionPolicy, RetentionReport, Snapshot,
    SnapshotRequest,
};
use crate::engine::config::{Config, ConfigError};
use crate::engine::database::{Database, DatabaseError};
use crate::engine::keystore::{InstallationSecrets, Keystore, KeystoreError};
use crate::engine::locks::{LockInfo, OperationLock};
use crate::engine::restore::{recover_interrupted, RecoveredRestore, RestoreError, RestoreOrchestrator, RestorePaths};
use crate::engine::signal::RestartSignal;

#[derive(Error, Debug)]
pub enum InstallationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Secrets(#[from] KeystoreError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Interrupted restore could not be recovered: {0}")]
    Recovery(#[from] RestoreError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

#[derive(Clone)]
pub struct Installation {
    pub dir: PathBuf,
    pub config: Config,
    pub audit: AuditLog,
    pub verifier: IntegrityVerifier,
    pub serializer: BackupSerializer,
    pub catalog: BackupCatalog,
    pub orchestrator: RestoreOrchestrator,
    pub locks: OperationLock,
    pub secrets: InstallationSecrets,
    pub restart: RestartSignal,
    /// Set when opening resolved a restore cut short by a crash
    pub recovered: Option<RecoveredRestore>,
}

/// Summary for `carelog status` and the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct InstallationStatus {
    pub name: String,
    pub database: PathBuf,
    pub backup_dir: PathBuf,
    pub audit_entries: usize,
    pub backups: usize,
    pub last_backup: Option<BackupRun>,
    pub active_locks: Vec<LockInfo>,
    pub restore_marker: bool,
    pub restart_pending: bool,
    pub backup_secret_configured: bool,
    pub cron_secret_configured: bool,
    pub checked_at: DateTime<Utc>,
}

impl Installation {
    pub fn open(dir: &Path) -> Result<Self, InstallationError> {
        let config = Config::load(dir)?;
        let secrets = Keystore::new(dir).load()?;
        Self::open_with(dir, config, secrets)
    }

    pub fn open_with(dir: &Path, config: Config, secrets: InstallationSecrets) -> Result<Self, InstallationError> {
        let live = config.database_path(dir);
        let recovered = recover_interrupted(&live)?;

        let db = Database::new(&live)?;
        let audit = AuditLog::new(db);
        if let Some(report) = &recovered {
            audit.record(report.audit_entry());
        }

        let locks = OperationLock::new(dir);
        let restart = RestartSignal::new();
        let backup_dir = config.backup_dir(dir);

        let serializer = BackupSerializer::new(audit.clone(), locks.clone(), secrets.clone(), backup_dir.clone());
        let catalog = BackupCatalog::new(backup_dir, audit.clone(), locks.clone());
        let orchestrator = RestoreOrchestrator::new(
            audit.clone(),
            catalog.clone(),
            locks.clone(),
            secrets.clone(),
            restart.clone(),
        );

        info!(installation = %config.installation.name, database = %live.display(), "installation opened");

        Ok(Self {
            dir: dir.to_path_buf(),
            verifier: IntegrityVerifier::new(audit.clone()),
            config,
            audit,
            serializer,
            catalog,
            orchestrator,
            locks,
            secrets,
            restart,
            recovered,
        })
    }

    /// Write config and secrets for a new installation, then open it
    pub fn init(dir: &Path, name: &str) -> Result<Self, InstallationError> {
        std::fs::create_dir_all(dir).map_err(ConfigError::from)?;
        let config = Config::default_for_installation(name);
        config.save(dir)?;
        Keystore::new(dir).generate()?;
        Self::open(dir)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_count: self.config.backup.max_count,
            max_age_days: self.config.backup.max_age_days,
        }
    }

    /// The cron job: a scheduled snapshot, then retention with configured
    /// bounds. Retention runs only after a successful snapshot.
    pub fn scheduled_backup(&self) -> Result<(Snapshot, RetentionReport), BackupError> {
        let snapshot = self
            .serializer
            .create_snapshot(self.config.backup.encrypt_scheduled, &SnapshotRequest::scheduled())?;
        let report = self.catalog.enforce_retention(self.retention_policy(), None)?;
        Ok((snapshot, report))
    }

    pub fn status(&self) -> Result<InstallationStatus, InstallationError> {
        let live = self.audit.database().path().to_path_buf();
        Ok(InstallationStatus {
            name: self.config.installation.name.clone(),
            restore_marker: RestorePaths::for_live(&live).marker.exists(),
            database: live,
            backup_dir: self.catalog.backup_dir().to_path_buf(),
            audit_entries: self.audit.count()?,
            backups: self.catalog.list()?.len(),
            last_backup: self.serializer.runs().recent_backups(1)?.into_iter().next(),
            active_locks: self.locks.get_active_locks(),
            restart_pending: self.restart.is_pending(),
            backup_secret_configured: self.secrets.backup_secret().is_some(),
            cron_secret_configured: self.secrets.has_cron_secret(),
            checked_at: Utc::now(),
        })
    }
}

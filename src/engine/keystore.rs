//! CareLog Keystore Module
//! Installation-wide secrets: the backup encryption secret and the cron
//! trigger bearer secret.

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const BACKUP_SECRET_ENV: &str = "CARELOG_BACKUP_SECRET";
pub const CRON_SECRET_ENV: &str = "CARELOG_CRON_SECRET";

const SECRETS_FILE: &str = "secrets.json";

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Secrets already exist: {0}")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SecretsFile {
    backup_secret: Option<String>,
    cron_secret: Option<String>,
}

/// Resolved secrets for one installation
#[derive(Clone, Default)]
pub struct InstallationSecrets {
    backup: Option<Arc<SecretString>>,
    cron: Option<Arc<SecretString>>,
}

impl std::fmt::Debug for InstallationSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationSecrets")
            .field("backup", &self.backup.is_some())
            .field("cron", &self.cron.is_some())
            .finish()
    }
}

/// Outcome of checking a presented cron bearer token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronAuth {
    Authorized,
    Missing,
    Invalid,
    NotConfigured,
}

impl InstallationSecrets {
    pub fn new(backup: Option<&str>, cron: Option<&str>) -> Self {
        Self {
            backup: backup.map(|s| Arc::new(SecretString::from(s.to_string()))),
            cron: cron.map(|s| Arc::new(SecretString::from(s.to_string()))),
        }
    }

    pub fn backup_secret(&self) -> Option<&SecretString> {
        self.backup.as_deref()
    }

    pub fn has_cron_secret(&self) -> bool {
        self.cron.is_some()
    }

    /// Constant-time comparison of a presented bearer token
    pub fn check_cron(&self, presented: Option<&str>) -> CronAuth {
        let Some(expected) = &self.cron else {
            return CronAuth::NotConfigured;
        };
        let Some(presented) = presented else {
            return CronAuth::Missing;
        };
        let matches: bool = expected
            .expose_secret()
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into();
        if matches {
            CronAuth::Authorized
        } else {
            CronAuth::Invalid
        }
    }
}

pub struct Keystore {
    secrets_dir: PathBuf,
}

impl Keystore {
    pub fn new(install_dir: &Path) -> Self {
        Self {
            secrets_dir: install_dir.join(".carelog"),
        }
    }

    fn secrets_path(&self) -> PathBuf {
        self.secrets_dir.join(SECRETS_FILE)
    }

    /// Environment variables win over the secrets file
    pub fn load(&self) -> Result<InstallationSecrets, KeystoreError> {
        let file = self.load_file()?;
        let backup = std::env::var(BACKUP_SECRET_ENV).ok().filter(|s| !s.is_empty()).or(file.backup_secret);
        let cron = std::env::var(CRON_SECRET_ENV).ok().filter(|s| !s.is_empty()).or(file.cron_secret);
        Ok(InstallationSecrets::new(backup.as_deref(), cron.as_deref()))
    }

    /// Generate fresh random secrets for a new installation
    pub fn generate(&self) -> Result<PathBuf, KeystoreError> {
        let path = self.secrets_path();
        if path.exists() {
            return Err(KeystoreError::AlreadyExists(path));
        }
        std::fs::create_dir_all(&self.secrets_dir)?;

        let file = SecretsFile {
            backup_secret: Some(random_secret()),
            cron_secret: Some(random_secret()),
        };
        std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;
        restrict_permissions(&path)?;
        Ok(path)
    }

    fn load_file(&self) -> Result<SecretsFile, KeystoreError> {
        let path = self.secrets_path();
        if !path.exists() {
            return Ok(SecretsFile::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cron_auth_outcomes() {
        let secrets = InstallationSecrets::new(None, Some("s3cret"));
        assert_eq!(secrets.check_cron(Some("s3cret")), CronAuth::Authorized);
        assert_eq!(secrets.check_cron(Some("s3cre")), CronAuth::Invalid);
        assert_eq!(secrets.check_cron(None), CronAuth::Missing);

        let unconfigured = InstallationSecrets::default();
        assert_eq!(unconfigured.check_cron(Some("s3cret")), CronAuth::NotConfigured);
    }

    #[test]
    fn test_generate_then_load() {
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path());
        keystore.generate().unwrap();

        let file = keystore.load_file().unwrap();
        assert_eq!(file.backup_secret.as_ref().map(|s| s.len()), Some(64));
        assert_ne!(file.backup_secret, file.cron_secret);

        assert!(matches!(keystore.generate(), Err(KeystoreError::AlreadyExists(_))));
    }

    #[test]
    fn test_debug_hides_values() {
        let secrets = InstallationSecrets::new(Some("backup-value"), None);
        let rendered = format!("{:?}", secrets);
        assert!(!rendered.contains("backup-value"));
    }
}

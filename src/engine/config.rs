//! CareLog Configuration Module
//! Handles loading and validating carelog.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "carelog.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub installation: InstallationConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationConfig {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// Backup directory and retention knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    /// Scheduled (cron) backups are written encrypted
    #[serde(default = "default_true")]
    pub encrypt_scheduled: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            max_count: default_max_count(),
            max_age_days: default_max_age_days(),
            encrypt_scheduled: true,
        }
    }
}

fn default_port() -> u16 {
    54330
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_max_count() -> usize {
    5
}

fn default_max_age_days() -> u32 {
    14
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(install_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = install_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, install_dir: &Path) -> Result<(), ConfigError> {
        let config_path = install_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn default_for_installation(name: &str) -> Self {
        Self {
            version: "0.1.0".to_string(),
            installation: InstallationConfig {
                name: name.to_string(),
                id: format!("carelog-{}", name),
            },
            database: DatabaseConfig {
                path: PathBuf::from("./data/carelog.db"),
            },
            api: ApiConfig::default(),
            backup: BackupConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database.path must not be empty".into()));
        }
        if self.backup.dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("backup.dir must not be empty".into()));
        }
        Ok(())
    }

    /// Live store path, resolved against the installation directory
    pub fn database_path(&self, install_dir: &Path) -> PathBuf {
        resolve(install_dir, &self.database.path)
    }

    pub fn backup_dir(&self, install_dir: &Path) -> PathBuf {
        resolve(install_dir, &self.backup.dir)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

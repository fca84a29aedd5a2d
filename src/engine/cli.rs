//! CareLog CLI Module
//! Command-line interface for installation administration

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "carelog")]
#[command(author = "CareLog Team")]
#[command(version)]
#[command(about = "Tamper-evident audit trail and backup/restore for on-premise clinics", long_about = None)]
pub struct Cli {
    /// Installation directory (defaults to current directory)
    #[arg(short, long, global = true)]
    pub project: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Actor id recorded on audit entries written by this command
    #[arg(long, global = true)]
    pub actor: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new installation
    Init {
        /// Installation name
        #[arg(short, long)]
        name: String,
    },

    /// Start local API server
    Serve {
        /// Port to listen on (defaults to config)
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (defaults to config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Backup management
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Restore the live store from a backup
    Restore {
        /// Artifact file name
        file: String,
    },

    /// Audit log commands
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Show installation status
    Status,
}

#[derive(Subcommand, Debug)]
pub enum BackupAction {
    /// Take a manual snapshot
    Create {
        /// Encrypt with the installation backup secret
        #[arg(long)]
        encrypted: bool,

        /// Free-text note stored in the manifest
        #[arg(short, long)]
        description: Option<String>,
    },

    /// List backups, newest first
    List,

    /// Delete one backup
    Delete {
        /// Artifact file name
        file: String,
    },

    /// Apply retention now
    Prune {
        #[arg(long)]
        max_count: Option<usize>,

        #[arg(long)]
        max_age_days: Option<u32>,
    },

    /// Show the configured and detected backup locations
    Location,
}

#[derive(Subcommand, Debug)]
pub enum AuditAction {
    /// Query audit entries
    List {
        #[arg(long)]
        actor: Option<String>,

        #[arg(long)]
        entity_type: Option<String>,

        #[arg(long)]
        entity_id: Option<String>,

        #[arg(long)]
        action: Option<String>,

        /// e.g. PATIENT_DATA, BACKUP, SECURITY
        #[arg(long)]
        category: Option<String>,

        /// RFC 3339 lower bound
        #[arg(long)]
        from: Option<String>,

        /// RFC 3339 upper bound
        #[arg(long)]
        to: Option<String>,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Recompute the checksum chain
    Verify {
        #[arg(long)]
        from_seq: Option<i64>,

        #[arg(long)]
        to_seq: Option<i64>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete entries older than a cutoff and re-anchor the chain
    Prune {
        /// RFC 3339 cutoff
        #[arg(long)]
        before: String,
    },
}

impl Cli {
    pub fn get_project_dir(&self) -> PathBuf {
        self.project
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

//! CareLog CLI - Main entry point for CLI binary
//!
//! Provides the `carelog` admin tool for an installation directory.

use anyhow::{bail, Context, Result};
use carelog_lib::engine::{
    api::{create_router, ApiState},
    audit::{AuditCategory, AuditQuery, SeqRange},
    backup::{detect_location, RetentionPolicy, SnapshotRequest},
    cli::{
        formatter::{format_age, format_millis, format_size, CliFormatter},
        AuditAction, BackupAction, Cli, Commands, OutputFormat,
    },
    installation::Installation,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit status telling a supervisor to start the server again
const EXIT_RESTART: i32 = 75;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("carelog=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            CliFormatter::error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}

fn run_cli(cli: Cli) -> Result<i32> {
    let project_dir = cli.get_project_dir();
    let json = cli.format == OutputFormat::Json;
    let actor = cli.actor.as_deref();

    match cli.command {
        Commands::Init { name } => cmd_init(&name, cli.project.as_deref(), json)?,
        Commands::Serve { port, host } => return cmd_serve(&project_dir, host, port),
        Commands::Backup { action } => cmd_backup(action, &project_dir, actor, json)?,
        Commands::Restore { file } => cmd_restore(&project_dir, &file, actor, json)?,
        Commands::Audit { action } => cmd_audit(action, &project_dir, actor, json)?,
        Commands::Status => cmd_status(&project_dir, json)?,
    }

    Ok(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open(project_dir: &Path) -> Result<Installation> {
    let install = Installation::open(project_dir)
        .with_context(|| format!("Could not open installation at {}", project_dir.display()))?;
    if let Some(recovered) = &install.recovered {
        CliFormatter::warning(&format!(
            "Recovered interrupted restore of {} (was {}, now {})",
            recovered.artifact,
            recovered.interrupted_phase,
            recovered.outcome.as_str()
        ));
    }
    Ok(install)
}

fn cmd_init(name: &str, explicit_dir: Option<&Path>, json: bool) -> Result<()> {
    let install_dir = match explicit_dir {
        Some(dir) => dir.to_path_buf(),
        None => dirs::home_dir()
            .context("Could not find home directory")?
            .join("CareLog")
            .join(name),
    };

    if install_dir.join(carelog_lib::engine::config::CONFIG_FILE).exists() {
        bail!("Installation already exists: {}", install_dir.display());
    }

    let install = Installation::init(&install_dir, name)?;

    if json {
        print_json(&serde_json::json!({
            "success": true,
            "installation_dir": install_dir,
            "name": name,
            "database": install.audit.database().path(),
            "backup_dir": install.catalog.backup_dir(),
        }))?;
    } else {
        CliFormatter::success(&format!("Created CareLog installation: {}", name));
        CliFormatter::kv("Directory", &install_dir.display().to_string());
        CliFormatter::kv("Database", &install.audit.database().path().display().to_string());
        CliFormatter::kv("Backups", &install.catalog.backup_dir().display().to_string());
        CliFormatter::info("Secrets written to .carelog/secrets.json; keep a copy off this machine");
    }
    Ok(())
}

#[tokio::main]
async fn cmd_serve(project_dir: &Path, host: Option<String>, port: Option<u16>) -> Result<i32> {
    let install = Arc::new(open(project_dir)?);
    let restart = install.restart.clone();

    let addr = format!(
        "{}:{}",
        host.unwrap_or_else(|| install.config.api.host.clone()),
        port.unwrap_or(install.config.api.port)
    );
    let app = create_router(ApiState {
        install: install.clone(),
    });

    CliFormatter::header("CareLog API Server");
    CliFormatter::kv("Installation", &install.config.installation.name);
    CliFormatter::kv("Listening", &format!("http://{}", addr));
    CliFormatter::info("Press Ctrl+C to stop");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Could not bind {}", addr))?;

    let watch = restart.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = async {
                    while !watch.is_pending() {
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                } => {
                    tracing::info!("restore committed, shutting down for restart");
                }
            }
        })
        .await?;

    if restart.is_pending() {
        CliFormatter::warning("Restore committed; exiting for restart");
        return Ok(EXIT_RESTART);
    }
    Ok(0)
}

fn cmd_backup(action: BackupAction, project_dir: &Path, actor: Option<&str>, json: bool) -> Result<()> {
    let install = open(project_dir)?;

    match action {
        BackupAction::Create { encrypted, description } => {
            let request = SnapshotRequest::manual(actor).with_description(description.as_deref());
            let snapshot = install.serializer.create_snapshot(encrypted, &request)?;
            if json {
                print_json(&snapshot)?;
            } else {
                CliFormatter::success(&format!("Created {}", snapshot.file_name));
                CliFormatter::kv("Size", &format_size(snapshot.size_bytes));
                CliFormatter::kv("SHA-256", &snapshot.checksum);
            }
        }
        BackupAction::List => {
            let artifacts = install.catalog.list()?;
            if json {
                print_json(&artifacts)?;
            } else if artifacts.is_empty() {
                CliFormatter::info("No backups yet");
            } else {
                CliFormatter::header(&format!("Backups in {}", install.catalog.backup_dir().display()));
                CliFormatter::table_header(&["File", "Created", "Size", "Enc", "Description"]);
                for artifact in &artifacts {
                    CliFormatter::backup_row(artifact);
                }
            }
        }
        BackupAction::Delete { file } => {
            install.catalog.delete(&file, actor)?;
            if json {
                print_json(&serde_json::json!({ "deleted": file }))?;
            } else {
                CliFormatter::success(&format!("Deleted {}", file));
            }
        }
        BackupAction::Prune { max_count, max_age_days } => {
            let configured = install.retention_policy();
            let policy = RetentionPolicy {
                max_count: max_count.unwrap_or(configured.max_count),
                max_age_days: max_age_days.unwrap_or(configured.max_age_days),
            };
            let report = install.catalog.enforce_retention(policy, actor)?;
            if json {
                print_json(&report)?;
            } else {
                CliFormatter::header(&format!(
                    "Retention (max {} backups, {} days)",
                    policy.max_count, policy.max_age_days
                ));
                CliFormatter::kv("Kept", &report.kept.len().to_string());
                for name in &report.deleted {
                    CliFormatter::item(&format!("deleted {}", name));
                }
                for name in &report.failed {
                    CliFormatter::warning(&format!("could not delete {}", name));
                }
            }
        }
        BackupAction::Location => {
            let detected = detect_location(project_dir);
            if json {
                print_json(&serde_json::json!({
                    "configured": install.catalog.backup_dir(),
                    "detected": detected,
                }))?;
            } else {
                CliFormatter::kv("Configured", &install.catalog.backup_dir().display().to_string());
                CliFormatter::kv("Suggested", &format!("{} ({:?})", detected.path.display(), detected.source));
                for alt in &detected.alternatives {
                    CliFormatter::item(&alt.display().to_string());
                }
            }
        }
    }
    Ok(())
}

fn cmd_restore(project_dir: &Path, file: &str, actor: Option<&str>, json: bool) -> Result<()> {
    let install = open(project_dir)?;
    let outcome = install.orchestrator.restore(file, actor)?;

    if json {
        print_json(&outcome)?;
    } else {
        CliFormatter::success(&format!("Restored {}", outcome.artifact));
        CliFormatter::kv("Phases", &outcome.trail().join(" → "));
        CliFormatter::kv("Data age (RPO)", &format_age(outcome.rpo_seconds));
        CliFormatter::kv("Duration (RTO)", &format_millis(outcome.rto_ms));
        CliFormatter::warning("Restart any running carelog server to pick up the restored store");
    }
    Ok(())
}

fn parse_time(flag: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("--{} must be RFC 3339, got {}", flag, v))
        })
        .transpose()
}

fn cmd_audit(action: AuditAction, project_dir: &Path, actor: Option<&str>, json: bool) -> Result<()> {
    let install = open(project_dir)?;

    match action {
        AuditAction::List {
            actor: filter_actor,
            entity_type,
            entity_id,
            action,
            category,
            from,
            to,
            limit,
            offset,
        } => {
            let category = category.map(|c| c.parse::<AuditCategory>()).transpose()?;
            let query = AuditQuery {
                actor_id: filter_actor,
                entity_type,
                entity_id,
                action,
                category,
                from: parse_time("from", from)?,
                to: parse_time("to", to)?,
                limit: Some(limit),
                offset: Some(offset),
                ..Default::default()
            };
            let page = install.audit.query(&query)?;
            if json {
                print_json(&page)?;
            } else {
                CliFormatter::header(&format!(
                    "Audit entries {}-{} of {}",
                    page.offset + usize::from(!page.entries.is_empty()),
                    page.offset + page.entries.len(),
                    page.total
                ));
                for entry in &page.entries {
                    CliFormatter::audit_row(entry);
                }
            }
        }
        AuditAction::Verify { from_seq, to_seq, limit } => {
            let report = install.verifier.verify(&SeqRange { from_seq, to_seq }, limit)?;
            if json {
                print_json(&report)?;
            } else if report.is_intact() {
                CliFormatter::success(&format!("Audit chain intact ({} entries)", report.total));
            } else {
                CliFormatter::error(&format!(
                    "Audit chain broken: {} of {} entries invalid",
                    report.invalid, report.total
                ));
                if let Some(id) = &report.first_invalid_id {
                    CliFormatter::kv("First invalid entry", id);
                }
            }
            if !report.is_intact() {
                bail!("integrity check failed");
            }
        }
        AuditAction::Prune { before } => {
            let cutoff = parse_time("before", Some(before))?.context("--before is required")?;
            let removed = install.audit.prune_before(cutoff, actor)?;
            if json {
                print_json(&serde_json::json!({ "removed": removed, "before": cutoff }))?;
            } else {
                CliFormatter::success(&format!("Removed {} audit entries older than {}", removed, cutoff));
            }
        }
    }
    Ok(())
}

fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let install = open(project_dir)?;
    let status = install.status()?;

    if json {
        return print_json(&status);
    }

    CliFormatter::header(&format!("CareLog: {}", status.name));
    CliFormatter::kv("Database", &status.database.display().to_string());
    CliFormatter::kv("Audit entries", &status.audit_entries.to_string());
    CliFormatter::kv("Backups", &format!("{} in {}", status.backups, status.backup_dir.display()));
    match &status.last_backup {
        Some(run) if run.success => CliFormatter::kv(
            "Last backup",
            &format!(
                "{} ago ({})",
                format_age((status.checked_at - run.started_at).num_seconds()),
                run.run_type.as_str()
            ),
        ),
        Some(run) => CliFormatter::warning(&format!(
            "Last backup failed: {}",
            run.error.as_deref().unwrap_or("unknown error")
        )),
        None => CliFormatter::warning("No backup has run yet"),
    }
    CliFormatter::kv(
        "Secrets",
        &format!(
            "backup {}, cron {}",
            if status.backup_secret_configured { "set" } else { "missing" },
            if status.cron_secret_configured { "set" } else { "missing" }
        ),
    );
    for lock in &status.active_locks {
        CliFormatter::item(&format!(
            "{} lock held by pid {} since {}",
            lock.lock_type.filename(),
            lock.pid,
            lock.started_at.format("%H:%M:%S")
        ));
    }
    if status.restore_marker {
        CliFormatter::warning("A restore marker is present; the next open will recover it");
    }
    if status.restart_pending {
        CliFormatter::warning("Restart pending");
    }
    Ok(())
}

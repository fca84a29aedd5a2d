//! CLI Output Formatting Module
//! Colorized terminal output for the carelog binary

use colored::Colorize;

use crate::engine::audit::{AuditEntry, Severity};
use crate::engine::backup::BackupArtifact;

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }

    pub fn table_header(columns: &[&str]) {
        let header = columns
            .iter()
            .map(|c| c.bright_white().bold().to_string())
            .collect::<Vec<_>>()
            .join(" │ ");
        println!("  {}", header);
        println!("  {}", "─".repeat(columns.iter().map(|c| c.len() + 3).sum()).bright_black());
    }

    pub fn table_row(values: &[&str]) {
        println!("  {}", values.join(" │ "));
    }

    /// One line per backup: name, age, size, flags
    pub fn backup_row(artifact: &BackupArtifact) {
        let created = artifact.created_at.format("%Y-%m-%d %H:%M").to_string();
        let size = format_size(artifact.size_bytes);
        Self::table_row(&[
            artifact.file_name.as_str(),
            created.as_str(),
            size.as_str(),
            if artifact.encrypted { "enc" } else { "-" },
            artifact.description.as_deref().unwrap_or(""),
        ]);
    }

    pub fn audit_row(entry: &AuditEntry) {
        let severity = match entry.severity {
            Severity::Info => entry.severity.as_str().normal(),
            Severity::Warning => entry.severity.as_str().yellow(),
            Severity::Error => entry.severity.as_str().red(),
            Severity::Critical => entry.severity.as_str().red().bold(),
        };
        println!(
            "  {} {} {} {} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().bright_black(),
            severity,
            entry.action.as_str().bright_white(),
            entry.actor_id.as_deref().unwrap_or("system"),
            entry.entity_id.as_deref().unwrap_or(&entry.entity_type).bright_black(),
        );
    }
}

/// Format file size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Milliseconds as `850ms`, `4.2s` or `3m 5s`
pub fn format_millis(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let seconds = ms / 1000;
        format!("{}m {}s", seconds / 60, seconds % 60)
    }
}

/// Seconds as a coarse age: `45s`, `12m`, `5h 3m`, `2d 4h`
pub fn format_age(seconds: i64) -> String {
    let seconds = seconds.max(0);
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m", seconds / 60)
    } else if seconds < 86_400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86_400, (seconds % 86_400) / 3600)
    }
}

//! Backup location discovery
//!
//! Suggests removable or external media for the backup directory during
//! setup. Never fails: anything unexpected falls back to the local default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    ExternalMedia,
    LocalDefault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedLocation {
    pub path: PathBuf,
    pub source: LocationSource,
    /// Other writable candidates, best first
    pub alternatives: Vec<PathBuf>,
}

/// Best-effort discovery of external storage, `<install dir>/backups` otherwise
pub fn detect_location(install_dir: &Path) -> DetectedLocation {
    let mut candidates: Vec<PathBuf> = media_dirs()
        .into_iter()
        .filter(|dir| is_writable(dir))
        .map(|dir| dir.join("carelog-backups"))
        .collect();
    candidates.sort();
    candidates.dedup();

    debug!(count = candidates.len(), "external backup candidates");

    match candidates.split_first() {
        Some((first, rest)) => DetectedLocation {
            path: first.clone(),
            source: LocationSource::ExternalMedia,
            alternatives: rest.to_vec(),
        },
        None => DetectedLocation {
            path: install_dir.join("backups"),
            source: LocationSource::LocalDefault,
            alternatives: Vec::new(),
        },
    }
}

#[cfg(target_os = "linux")]
fn media_dirs() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(user) = std::env::var("USER") {
        roots.push(PathBuf::from("/media").join(&user));
        roots.push(PathBuf::from("/run/media").join(&user));
    }
    roots.push(PathBuf::from("/mnt"));
    roots.iter().flat_map(|root| subdirectories(root)).collect()
}

#[cfg(target_os = "macos")]
fn media_dirs() -> Vec<PathBuf> {
    subdirectories(Path::new("/Volumes"))
        .into_iter()
        // The system volume is listed alongside external ones
        .filter(|p| p.file_name().map(|n| n != "Macintosh HD").unwrap_or(false))
        .collect()
}

/// Drive letters other than the system drive
#[cfg(target_os = "windows")]
fn media_dirs() -> Vec<PathBuf> {
    (b'D'..=b'Z')
        .map(|letter| PathBuf::from(format!("{}:\\", letter as char)))
        .filter(|p| p.is_dir())
        .collect()
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn media_dirs() -> Vec<PathBuf> {
    Vec::new()
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn subdirectories(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect()
}

fn is_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".carelog-probe-{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fallback_stays_inside_install_dir() {
        let dir = tempdir().unwrap();
        let detected = detect_location(dir.path());
        match detected.source {
            LocationSource::LocalDefault => {
                assert_eq!(detected.path, dir.path().join("backups"));
                assert!(detected.alternatives.is_empty());
            }
            LocationSource::ExternalMedia => {
                assert!(detected.path.ends_with("carelog-backups"));
            }
        }
    }

    #[test]
    fn test_writable_probe() {
        let dir = tempdir().unwrap();
        assert!(is_writable(dir.path()));
        assert!(!is_writable(&dir.path().join("missing")));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

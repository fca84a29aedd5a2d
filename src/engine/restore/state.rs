//! Restore State Machine
//!
//! Phases of one restore attempt, persisted as a durable marker next to the
//! live store so an interrupted restore is detectable on the next start.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CANDIDATE_SUFFIX: &str = ".restore-candidate";
pub const QUARANTINE_SUFFIX: &str = ".restore-quarantine";
pub const MARKER_SUFFIX: &str = ".restore-marker.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestorePhase {
    Idle,
    /// Artifact checked and staged as the candidate
    Validating,
    /// Live store moved to quarantine, candidate moving in
    Swapping,
    /// Structural check of the swapped-in store
    Verifying,
    /// Verification passed; only quarantine cleanup remains
    Committing,
    Committed,
    RolledBack,
}

impl RestorePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestorePhase::Idle => "IDLE",
            RestorePhase::Validating => "VALIDATING",
            RestorePhase::Swapping => "SWAPPING",
            RestorePhase::Verifying => "VERIFYING",
            RestorePhase::Committing => "COMMITTING",
            RestorePhase::Committed => "COMMITTED",
            RestorePhase::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RestorePhase::Committed | RestorePhase::RolledBack)
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Files a restore works with, all beside the live store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePaths {
    pub live: PathBuf,
    pub candidate: PathBuf,
    pub quarantine: PathBuf,
    pub marker: PathBuf,
}

impl RestorePaths {
    pub fn for_live(live: &Path) -> Self {
        let with_suffix = |suffix: &str| {
            let mut name = live.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        };
        Self {
            live: live.to_path_buf(),
            candidate: with_suffix(CANDIDATE_SUFFIX),
            quarantine: with_suffix(QUARANTINE_SUFFIX),
            marker: with_suffix(MARKER_SUFFIX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub phase: RestorePhase,
    pub at: DateTime<Utc>,
}

/// Durable record of a restore in progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMarker {
    pub artifact: String,
    pub actor_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub phase: RestorePhase,
    pub transitions: Vec<Transition>,
    /// SHA-256 of the live store before the swap
    pub original_checksum: Option<String>,
    /// Why the attempt stopped, set when the marker is left for recovery
    #[serde(default)]
    pub failure: Option<String>,
}

impl RestoreMarker {
    pub fn new(artifact: &str, actor_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            artifact: artifact.to_string(),
            actor_id: actor_id.map(String::from),
            started_at: now,
            phase: RestorePhase::Idle,
            transitions: vec![Transition {
                phase: RestorePhase::Idle,
                at: now,
            }],
            original_checksum: None,
            failure: None,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| StateError::ReadError(e.to_string()))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::ParseError(e.to_string()))
    }

    /// Save state to disk atomically
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| StateError::SerializeError(e.to_string()))?;

        let mut temp = path.as_os_str().to_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            std::io::Write::write_all(&mut file, content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp, path)
        };
        write().map_err(|e| StateError::WriteError(e.to_string()))
    }

    pub fn remove(path: &Path) -> Result<(), StateError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::WriteError(e.to_string())),
        }
    }

    /// Record the phase and persist it before the phase's work starts
    pub fn advance(&mut self, phase: RestorePhase, path: &Path) -> Result<(), StateError> {
        self.phase = phase;
        self.transitions.push(Transition { phase, at: Utc::now() });
        self.save(path)
    }

    /// Same as `advance` for the terminal phases, where the marker is about
    /// to disappear and a failed write changes nothing.
    pub fn settle(&mut self, phase: RestorePhase, path: &Path) {
        if let Err(e) = self.advance(phase, path) {
            tracing::warn!(error = %e, phase = phase.as_str(), "restore marker not updated");
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("Failed to read restore marker: {0}")]
    ReadError(String),
    #[error("Failed to write restore marker: {0}")]
    WriteError(String),
    #[error("Failed to parse restore marker: {0}")]
    ParseError(String),
    #[error("Failed to serialize restore marker: {0}")]
    SerializeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paths_sit_beside_live_store() {
        let paths = RestorePaths::for_live(Path::new("/srv/carelog/data/carelog.db"));
        assert_eq!(paths.candidate, PathBuf::from("/srv/carelog/data/carelog.db.restore-candidate"));
        assert_eq!(paths.quarantine, PathBuf::from("/srv/carelog/data/carelog.db.restore-quarantine"));
        assert_eq!(paths.marker, PathBuf::from("/srv/carelog/data/carelog.db.restore-marker.json"));
    }

    #[test]
    fn test_marker_persists_each_phase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.db.restore-marker.json");

        assert!(RestoreMarker::load(&path).unwrap().is_none());

        let mut marker = RestoreMarker::new("carelog-backup-20261014T090507042Z-manual.db", Some("admin"));
        marker.advance(RestorePhase::Validating, &path).unwrap();
        marker.advance(RestorePhase::Swapping, &path).unwrap();

        let loaded = RestoreMarker::load(&path).unwrap().unwrap();
        assert_eq!(loaded.phase, RestorePhase::Swapping);
        let phases: Vec<_> = loaded.transitions.iter().map(|t| t.phase).collect();
        assert_eq!(
            phases,
            vec![RestorePhase::Idle, RestorePhase::Validating, RestorePhase::Swapping]
        );
        assert_eq!(loaded.actor_id.as_deref(), Some("admin"));

        RestoreMarker::remove(&path).unwrap();
        RestoreMarker::remove(&path).unwrap();
        assert!(RestoreMarker::load(&path).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unreadable_marker_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("marker.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(RestoreMarker::load(&path), Err(StateError::ParseError(_))));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(RestorePhase::Committed.is_terminal());
        assert!(RestorePhase::RolledBack.is_terminal());
        assert!(!RestorePhase::Committing.is_terminal());
    }
}

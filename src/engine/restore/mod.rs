//! Backup/Restore Pipeline: restore side

pub mod orchestrator;
pub mod state;

pub use orchestrator::{recover_interrupted, FaultPoint, RecoveredRestore, RestoreError, RestoreOrchestrator, RestoreOutcome};
pub use state::{RestoreMarker, RestorePaths, RestorePhase, Transition};

use carelog_lib::engine::audit::{AuditAction, AuditQuery, SeqRange, SortOrder};
use carelog_lib::engine::backup::{file_checksum, RecoveryOutcome, SnapshotRequest};
use carelog_lib::engine::config::Config;
use carelog_lib::engine::error::{Classify, ErrorKind};
use carelog_lib::engine::installation::Installation;
use carelog_lib::engine::keystore::InstallationSecrets;
use carelog_lib::engine::locks::LockType;
use carelog_lib::engine::restore::{RestoreError, RestoreMarker, RestorePaths, RestorePhase};
use std::path::Path;

fn open(dir: &Path) -> Installation {
    Installation::open_with(
        dir,
        Config::default_for_installation("clinic"),
        InstallationSecrets::new(Some("backup-secret"), None),
    )
    .unwrap()
}

fn set_allergy(install: &Installation, value: &str) {
    let conn = install.audit.database().get_connection().unwrap();
    conn.execute_batch("CREATE TABLE IF NOT EXISTS allergies (patient TEXT PRIMARY KEY, note TEXT);")
        .unwrap();
    conn.execute("INSERT OR REPLACE INTO allergies VALUES ('p-7', ?1)", [value])
        .unwrap();
}

fn allergy(install: &Installation) -> String {
    install
        .audit
        .database()
        .get_connection()
        .unwrap()
        .query_row("SELECT note FROM allergies WHERE patient = 'p-7'", [], |r| r.get(0))
        .unwrap()
}

#[test]
fn test_restore_to_encrypted_snapshot() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let install = open(root.path());

    // 1. Snapshot state B, then move the live store on to A
    set_allergy(&install, "penicillin");
    let snapshot = install
        .serializer
        .create_snapshot(true, &SnapshotRequest::manual(Some("admin")))?;
    set_allergy(&install, "none known");
    assert!(!install.restart.is_pending());

    // 2. Restore B
    let outcome = install.orchestrator.restore(&snapshot.file_name, Some("admin"))?;
    assert_eq!(outcome.phase, RestorePhase::Committed);
    assert!(outcome.restart_required);
    assert!(install.restart.is_pending());

    // 3. The live store is B, and its log tells the story
    assert_eq!(allergy(&install), "penicillin");
    let page = install.audit.query(&AuditQuery {
        order: SortOrder::Asc,
        limit: Some(1000),
        ..Default::default()
    })?;
    let committed = page
        .entries
        .iter()
        .find(|e| e.action == AuditAction::RestoreCommitted)
        .expect("committed entry");
    assert_eq!(committed.actor_id.as_deref(), Some("admin"));
    assert_eq!(committed.entity_id.as_deref(), Some(snapshot.file_name.as_str()));
    assert!(committed.metadata["rto_ms"].is_u64());

    let runs = install.serializer.runs().recovery_tests(5)?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, RecoveryOutcome::Committed);

    // 4. No restore debris beside the live store
    let paths = RestorePaths::for_live(install.audit.database().path());
    assert!(!paths.candidate.exists());
    assert!(!paths.quarantine.exists());
    assert!(!paths.marker.exists());

    // 5. A fresh open sees the same store
    drop(install);
    let reopened = open(root.path());
    assert_eq!(allergy(&reopened), "penicillin");
    assert!(reopened.recovered.is_none());
    Ok(())
}

#[test]
fn test_restore_refused_while_backup_lock_held() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let install = open(root.path());
    set_allergy(&install, "latex");
    let snapshot = install.serializer.create_snapshot(false, &SnapshotRequest::scheduled())?;

    let live = install.audit.database().path().to_path_buf();
    let before = file_checksum(&live)?;

    let guard = install.locks.acquire(LockType::Backup)?;
    let err = install
        .orchestrator
        .restore(&snapshot.file_name, Some("admin"))
        .unwrap_err();
    assert!(matches!(err, RestoreError::Locked(_)));
    assert_eq!(err.kind(), ErrorKind::Concurrency);
    drop(guard);

    assert_eq!(file_checksum(&live)?, before);
    assert!(!install.restart.is_pending());
    assert!(!RestorePaths::for_live(&live).marker.exists());
    Ok(())
}

#[test]
fn test_startup_recovers_crash_mid_swap() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let live;
    {
        let install = open(root.path());
        set_allergy(&install, "sulfa");
        live = install.audit.database().path().to_path_buf();
    }

    // Simulate a crash after the live store moved to quarantine and a
    // half-copied candidate took its place
    let paths = RestorePaths::for_live(&live);
    std::fs::rename(&live, &paths.quarantine)?;
    std::fs::write(&live, b"partial")?;
    let mut marker = RestoreMarker::new("carelog-backup-20261001T020000000Z-scheduled.db", Some("admin"));
    marker.advance(RestorePhase::Validating, &paths.marker)?;
    marker.advance(RestorePhase::Swapping, &paths.marker)?;

    let install = open(root.path());
    let recovered = install.recovered.as_ref().expect("recovery report");
    assert_eq!(recovered.interrupted_phase, RestorePhase::Swapping);
    assert_eq!(recovered.outcome, RecoveryOutcome::RolledBack);
    assert_eq!(allergy(&install), "sulfa");
    assert!(!paths.quarantine.exists());
    assert!(!paths.marker.exists());
    assert_eq!(install.audit.last_entry()?.unwrap().action, AuditAction::RestoreRecovered);
    Ok(())
}

#[test]
fn test_corrupted_artifact_rejected_before_swap() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let install = open(root.path());
    set_allergy(&install, "aspirin");
    let snapshot = install.serializer.create_snapshot(false, &SnapshotRequest::manual(Some("admin")))?;
    set_allergy(&install, "none known");

    // Damage the artifact after its manifest checksum was written
    let artifact = install.catalog.resolve(&snapshot.file_name)?;
    let mut bytes = std::fs::read(&artifact)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    std::fs::write(&artifact, &bytes)?;

    let live = install.audit.database().path().to_path_buf();
    #[cfg(unix)]
    let inode_before = std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&live)?);

    let err = install
        .orchestrator
        .restore(&snapshot.file_name, Some("admin"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);

    // The live store was never moved and still holds the newer data
    #[cfg(unix)]
    assert_eq!(
        std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&live)?),
        inode_before
    );
    assert_eq!(allergy(&install), "none known");
    assert!(!install.restart.is_pending());

    let last = install.audit.last_entry()?.unwrap();
    assert_eq!(last.action, AuditAction::RestoreRejected);
    assert_eq!(last.entity_id.as_deref(), Some(snapshot.file_name.as_str()));
    let actions: Vec<_> = install
        .audit
        .query(&AuditQuery {
            order: SortOrder::Asc,
            limit: Some(1000),
            ..Default::default()
        })?
        .entries
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(!actions.contains(&AuditAction::RestoreSwapping));
    assert!(install.verifier.verify(&SeqRange::default(), None)?.is_intact());

    let runs = install.serializer.runs().recovery_tests(5)?;
    assert_eq!(runs[0].outcome, RecoveryOutcome::Failed);
    assert!(runs[0].error.is_some());

    let paths = RestorePaths::for_live(&live);
    assert!(!paths.candidate.exists());
    assert!(!paths.quarantine.exists());
    assert!(!paths.marker.exists());
    Ok(())
}

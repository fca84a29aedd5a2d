use carelog_lib::engine::audit::AuditAction;
use carelog_lib::engine::backup::{
    artifact_name, cipher, file_checksum, BackupError, RetentionPolicy, RunType, SnapshotRequest,
};
use carelog_lib::engine::config::Config;
use carelog_lib::engine::error::{Classify, ErrorKind};
use carelog_lib::engine::installation::Installation;
use carelog_lib::engine::keystore::InstallationSecrets;
use chrono::{Duration, Utc};
use secrecy::SecretString;
use std::fs;

fn open(dir: &std::path::Path) -> Installation {
    Installation::open_with(
        dir,
        Config::default_for_installation("clinic"),
        InstallationSecrets::new(Some("backup-secret"), Some("cron-secret")),
    )
    .unwrap()
}

#[test]
fn test_retention_over_ten_daily_artifacts() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let install = open(root.path());
    let backup_dir = install.catalog.backup_dir().to_path_buf();
    fs::create_dir_all(&backup_dir)?;

    // 1. Ten artifacts, one per day going back from yesterday
    let now = Utc::now();
    let mut names = Vec::new();
    for day in 1..=10 {
        let name = artifact_name(&(now - Duration::days(day)), RunType::Scheduled, false);
        fs::write(backup_dir.join(&name), b"SQLite format 3\0")?;
        names.push(name);
    }

    // 2. Five newest survive, five oldest go
    let report = install.catalog.enforce_retention(
        RetentionPolicy {
            max_count: 5,
            max_age_days: 14,
        },
        Some("admin"),
    )?;
    assert_eq!(report.kept, names[..5].to_vec());
    let mut deleted = report.deleted.clone();
    deleted.sort();
    let mut oldest = names[5..].to_vec();
    oldest.sort();
    assert_eq!(deleted, oldest);
    assert!(report.failed.is_empty());

    // 3. max_count 0 never empties the catalog
    let report = install.catalog.enforce_retention(
        RetentionPolicy {
            max_count: 0,
            max_age_days: 0,
        },
        None,
    )?;
    assert_eq!(report.kept, vec![names[0].clone()]);
    assert_eq!(install.catalog.list()?.len(), 1);

    let last = install.audit.last_entry()?.unwrap();
    assert_eq!(last.action, AuditAction::BackupPrune);
    Ok(())
}

#[test]
fn test_encrypted_snapshot_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let install = open(root.path());

    let plain = install
        .serializer
        .create_snapshot(false, &SnapshotRequest::manual(Some("admin")))?;
    std::thread::sleep(std::time::Duration::from_millis(5));
    let sealed = install
        .serializer
        .create_snapshot(true, &SnapshotRequest::manual(Some("admin")).with_description(Some("weekly")))?;
    assert!(sealed.file_name.ends_with(".db.enc"));
    assert!(cipher::is_encrypted(&fs::read(&sealed.file_path)?));

    // Correct secret reproduces a valid store
    let out = root.path().join("decrypted.db");
    let secret = SecretString::from("backup-secret".to_string());
    cipher::decrypt_file(&sealed.file_path, &out, &secret)?;
    assert_eq!(&fs::read(&out)?[..16], b"SQLite format 3\0");

    // Wrong secret fails with nothing left behind
    let wrong_out = root.path().join("wrong.db");
    let wrong = SecretString::from("not-the-secret".to_string());
    let err = cipher::decrypt_file(&sealed.file_path, &wrong_out, &wrong).unwrap_err();
    assert!(matches!(err, BackupError::DecryptionFailed));
    assert!(!wrong_out.exists());

    // The plaintext artifact is untouched by any of this
    assert_eq!(file_checksum(&plain.file_path)?, plain.checksum);

    let listed = install.catalog.list()?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].file_name, sealed.file_name);
    assert_eq!(listed[0].description.as_deref(), Some("weekly"));
    Ok(())
}

#[test]
fn test_traversal_names_rejected_before_filesystem() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let install = open(root.path());
    let outside = root.path().join("secret");
    fs::write(&outside, b"keep me")?;

    for name in ["../../etc/passwd", "..%2fsecret", "../secret", "carelog-backup-x.db"] {
        let err = install.catalog.delete(name, Some("mallory")).unwrap_err();
        assert!(matches!(err, BackupError::InvalidName(_)), "{} was not rejected", name);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert!(outside.exists());

    // A well-formed name that does not exist is NotFound, not Validation
    let missing = artifact_name(&Utc::now(), RunType::Manual, false);
    assert_eq!(
        install.catalog.delete(&missing, None).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    Ok(())
}

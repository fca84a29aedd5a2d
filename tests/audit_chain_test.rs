use carelog_lib::engine::audit::{
    AuditAction, AuditCategory, AuditLog, AuditQuery, IntegrityVerifier, NewAuditEntry, SeqRange, Severity,
};
use carelog_lib::engine::database::Database;
use chrono::{Duration, Utc};

fn chart_view(actor: &str, patient: &str) -> NewAuditEntry {
    NewAuditEntry::new(AuditAction::Custom("CHART_VIEW".into()), AuditCategory::Clinical, "patient")
        .with_actor(Some(actor))
        .with_entity_id(patient)
}

#[test]
fn test_concurrent_appends_form_one_chain() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let log = AuditLog::new(Database::new(&root.path().join("live.db"))?);

    // 1. Ten nurses, ten chart views each, all at once
    std::thread::scope(|scope| {
        for nurse in 0..10 {
            let log = &log;
            scope.spawn(move || {
                for patient in 0..10 {
                    log.append(chart_view(&format!("nurse-{}", nurse), &format!("p-{}", patient)))
                        .unwrap();
                }
            });
        }
    });
    assert_eq!(log.count()?, 100);

    // 2. No two entries share a predecessor
    let conn = log.database().get_connection()?;
    let distinct: i64 = conn.query_row("SELECT COUNT(DISTINCT prev_checksum) FROM audit_log", [], |r| r.get(0))?;
    assert_eq!(distinct, 100);
    drop(conn);

    // 3. The verifier agrees
    let report = IntegrityVerifier::new(log.clone()).verify(&SeqRange::default(), None)?;
    assert_eq!(report.total, 100);
    assert_eq!(report.invalid, 0);
    assert_eq!(report.severity, Severity::Info);
    Ok(())
}

#[test]
fn test_tampered_field_invalidates_rest_of_chain() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let log = AuditLog::new(Database::new(&root.path().join("live.db"))?);
    let verifier = IntegrityVerifier::new(log.clone());

    let mut seqs = Vec::new();
    for i in 0..10 {
        seqs.push(log.append(chart_view("dr.osei", &format!("p-{}", i)))?.seq);
    }

    // Rewrite who looked at chart 4
    let tampered = seqs[3];
    log.database().get_connection()?.execute(
        "UPDATE audit_log SET actor_id = 'someone.else' WHERE seq = ?1",
        [tampered],
    )?;

    let range = SeqRange {
        from_seq: Some(seqs[0]),
        to_seq: Some(seqs[9]),
    };
    let report = verifier.verify(&range, None)?;
    assert_eq!(report.total, 10);
    assert_eq!(report.valid, 3);
    assert_eq!(report.invalid, 7);
    assert_eq!(report.first_invalid_seq, Some(tampered));
    assert_eq!(report.severity, Severity::Warning);
    assert!(report.clone().into_result().is_err());

    // The failed verification is itself on the record
    let last = log.last_entry()?.unwrap();
    assert_eq!(last.action, AuditAction::AuditVerify);
    assert_eq!(last.severity, Severity::Warning);
    Ok(())
}

#[test]
fn test_prune_keeps_remaining_chain_verifiable() -> Result<(), Box<dyn std::error::Error>> {
    let root = tempfile::tempdir()?;
    let log = AuditLog::new(Database::new(&root.path().join("live.db"))?);

    for i in 0..6 {
        log.append(chart_view("dr.osei", &format!("p-{}", i)))?;
    }
    let cutoff = Utc::now() + Duration::seconds(1);
    std::thread::sleep(std::time::Duration::from_millis(1100));
    for i in 6..9 {
        log.append(chart_view("dr.osei", &format!("p-{}", i)))?;
    }

    let removed = log.prune_before(cutoff, Some("admin"))?;
    assert_eq!(removed, 6);

    let report = IntegrityVerifier::new(log.clone()).verify(&SeqRange::default(), None)?;
    assert_eq!(report.invalid, 0);
    assert!(report.total >= 4);

    let pruned = log.query(&AuditQuery {
        action: Some("AUDIT_PRUNE".into()),
        ..Default::default()
    })?;
    assert_eq!(pruned.total, 1);
    assert_eq!(pruned.entries[0].actor_id.as_deref(), Some("admin"));
    Ok(())
}

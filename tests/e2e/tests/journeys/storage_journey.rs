//! Journey: open a project database, keep it healthy with prune/checkpoint/
//! backup, and refuse to run against a database from a newer build.

use aidd_core::{
    NewDetection, NewObservation, NewPattern, ObservationType, PruneOptions, Storage,
    StorageError, LATEST_VERSION,
};
use aidd_e2e_tests::{TestDataFactory, TestDatabaseManager};
use tempfile::TempDir;

#[test]
fn test_project_database_migrates_once() {
    let root = TempDir::new().unwrap();

    let db = TestDatabaseManager::new_in_project(root.path());
    assert_eq!(db.storage.migrations_applied(), LATEST_VERSION);
    assert_eq!(db.storage.schema_version().unwrap(), LATEST_VERSION);
    assert!(db.storage.migration_backup().is_none());
    TestDataFactory::decision(&db.memory(), "Store state under .aidd");
    drop(db);

    let again = TestDatabaseManager::new_in_project(root.path());
    assert_eq!(again.storage.migrations_applied(), 0);
    assert_eq!(again.stats().decisions, 1);
}

#[test]
fn test_newer_schema_is_fatal() {
    let db = TestDatabaseManager::new_temp();
    db.storage
        .write(|conn| {
            conn.execute(
                "UPDATE meta SET value = '999' WHERE key = 'schema_version'",
                [],
            )?;
            Ok(())
        })
        .unwrap();
    let path = db.path().to_path_buf();

    match Storage::new(Some(path)) {
        Err(e @ StorageError::SchemaTooNew { found: 999, .. }) => assert!(e.is_fatal()),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("opened a database from a newer build"),
    }
}

#[test]
fn test_prune_keeps_recent_work_searchable() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();

    let old = TestDataFactory::active_session(&sessions, "main");
    for i in 0..3 {
        sessions
            .save_observation(NewObservation::new(
                &old.id,
                ObservationType::Insight,
                format!("legacy cache note {}", i),
                "",
            ))
            .unwrap();
    }
    std::thread::sleep(std::time::Duration::from_millis(5));
    let recent = TestDataFactory::active_session(&sessions, "main");
    let kept = TestDataFactory::observation(
        &sessions,
        &recent.id,
        ObservationType::Insight,
        "fresh cache note",
        "",
    );

    let report = db
        .storage
        .prune_stale_data(&PruneOptions {
            keep_recent_sessions: 1,
            ..PruneOptions::default()
        })
        .unwrap();
    assert_eq!(report.observations_of_old_sessions, 3);
    assert_eq!(report.total(), 3);

    let hits = db
        .search()
        .search("cache", &Default::default())
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, kept.id);

    assert!(matches!(
        db.storage.prune_stale_data(&PruneOptions {
            detection_max_age_days: -1,
            ..PruneOptions::default()
        }),
        Err(StorageError::Validation(_))
    ));
}

#[test]
fn test_checkpoint_and_backup_preserve_data() {
    let db = TestDatabaseManager::new_temp();
    let patterns = db.patterns();

    let pattern = patterns
        .add_pattern(NewPattern {
            pattern: "as any".to_string(),
            ..Default::default()
        })
        .unwrap();
    patterns
        .record_detection(NewDetection {
            pattern_id: pattern.id.clone(),
            model: Some("test-model".to_string()),
            ..Default::default()
        })
        .unwrap();

    let checkpoint = db.storage.checkpoint().unwrap();
    assert!(!checkpoint.busy);

    let out = TempDir::new().unwrap();
    let backup_path = out.path().join("backup.db");
    db.storage.backup_to(&backup_path).unwrap();

    let restored = Storage::new(Some(backup_path)).unwrap();
    let stats = restored.stats().unwrap();
    assert_eq!(stats.banned_patterns, 1);
    assert_eq!(stats.pattern_detections, 1);
    assert_eq!(stats.schema_version, LATEST_VERSION);
}

//! Journey: work on a feature branch across several sessions, fold each
//! finished session into the branch context, walk the feature lifecycle,
//! then merge the branch and score project health.

use aidd_core::{
    BranchUpdate, HealthScorer, LifecyclePhase, LifecycleStatus, SessionFilter, SessionOutcome,
    SessionStatus, StorageError,
};
use aidd_e2e_tests::mocks::SessionSpec;
use aidd_e2e_tests::{TestDataFactory, TestDatabaseManager};

#[test]
fn test_feature_branch_from_first_session_to_merge() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();
    let branches = db.branches();

    let first = TestDataFactory::completed_session(
        &sessions,
        SessionSpec {
            branch: "feature/auth".to_string(),
            decisions: vec!["Use JWT access tokens".to_string()],
            files_modified: vec!["src/auth.ts".to_string(), "src/api.ts".to_string()],
            ..SessionSpec::default()
        },
    );
    let second = TestDataFactory::completed_session(
        &sessions,
        SessionSpec {
            branch: "feature/auth".to_string(),
            errors_resolved: vec!["token expired during refresh".to_string()],
            files_modified: vec!["src/auth.ts".to_string(), "src/refresh.ts".to_string()],
            ..SessionSpec::default()
        },
    );

    branches.promote(&first.id, "feature/auth").unwrap();
    let context = branches.promote(&second.id, "feature/auth").unwrap();

    assert_eq!(context.sessions_count, 2);
    assert_eq!(context.decisions, vec!["Use JWT access tokens".to_string()]);
    assert_eq!(
        context.errors_encountered,
        vec!["token expired during refresh".to_string()]
    );
    assert_eq!(
        context.files_modified,
        vec!["src/auth.ts", "src/api.ts", "src/refresh.ts"]
    );
    assert!(context.total_duration_ms >= 0);

    branches
        .save(
            "feature/auth",
            BranchUpdate {
                pending_tasks: Some(vec!["Write logout flow".to_string()]),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(
        branches.get("feature/auth").unwrap().pending_tasks,
        vec!["Write logout flow".to_string()]
    );

    let archived = branches.merge("feature/auth").unwrap();
    assert!(archived.archive_name.starts_with("feature/auth-"));
    assert_eq!(archived.context.sessions_count, 2);

    // The live context is gone, the archive remains
    let fresh = branches.get("feature/auth").unwrap();
    assert_eq!(fresh.sessions_count, 0);
    assert!(fresh.updated_at.is_none());
    assert_eq!(branches.list_archived(Some("feature/auth")).unwrap().len(), 1);

    // Merging again has nothing to archive
    assert!(matches!(
        branches.merge("feature/auth"),
        Err(StorageError::NotFound(_))
    ));
}

#[test]
fn test_active_session_cannot_be_promoted_and_ended_session_is_frozen() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();
    let branches = db.branches();

    let active = TestDataFactory::active_session(&sessions, "main");
    assert!(matches!(
        branches.promote(&active.id, "main"),
        Err(StorageError::Validation(_))
    ));

    let ended = sessions
        .end(
            &active.id,
            Some(SessionOutcome {
                tests_passing: true,
                revert_count: 0,
                compliance_score: 70.0,
            }),
        )
        .unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);

    let mut edited = ended.clone();
    edited.decisions.push("late edit".to_string());
    assert!(matches!(
        sessions.save(&edited),
        Err(StorageError::Validation(_))
    ));
    assert!(matches!(
        sessions.end(&active.id, None),
        Err(StorageError::Validation(_))
    ));

    let listed = sessions
        .list(&SessionFilter {
            status: Some(SessionStatus::Completed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].decisions.is_empty());
}

#[test]
fn test_lifecycle_walks_every_phase_in_order() {
    let db = TestDatabaseManager::new_temp();
    let lifecycles = db.lifecycles();

    let started = lifecycles.start("checkout-redesign", None).unwrap();
    assert_eq!(started.current_phase, LifecyclePhase::Brainstorm);

    // Skipping ahead is rejected
    assert!(lifecycles.advance(&started.id, LifecyclePhase::Plan).is_err());

    let mut current = started;
    for phase in LifecyclePhase::ALL.iter().skip(1) {
        current = lifecycles.advance(&current.id, *phase).unwrap();
        assert_eq!(current.current_phase, *phase);
    }
    assert_eq!(current.current_phase, LifecyclePhase::Ship);

    let done = lifecycles.complete(&current.id).unwrap();
    assert_eq!(done.status, LifecycleStatus::Completed);
    assert!(lifecycles.advance(&done.id, LifecyclePhase::Ship).is_err());
}

#[test]
fn test_health_reflects_session_history() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();

    TestDataFactory::seed_completed_sessions(&sessions, 4, 95.0, true);
    TestDataFactory::mistake(&db.memory(), "database is locked");

    let report = HealthScorer::new(db.storage.clone()).score(20).unwrap();
    assert_eq!(report.sessions_considered, 4);
    assert_eq!(report.mistakes_considered, 1);
    assert_eq!(report.breakdown.success_rate, 100.0);
    assert_eq!(report.breakdown.compliance, 95.0);
    assert_eq!(report.breakdown.non_recurrence, 100.0);
    assert_eq!(report.breakdown.utilization, 100.0);
    assert!(report.score >= 90);
    assert_eq!(report.recommendations.len(), 1);

    // A poor run drags the score down and produces advice
    TestDataFactory::seed_completed_sessions(&sessions, 4, 20.0, false);
    let worse = HealthScorer::new(db.storage.clone()).score(20).unwrap();
    assert!(worse.score < report.score);
    assert!(worse
        .recommendations
        .iter()
        .any(|r| r.starts_with("Session success rate is 50%")));
}

//! Journey: improvement candidates move through review, get applied and
//! reverted, and lose confidence when the convention behind them is deleted.

use aidd_core::{
    CandidateFilter, CandidateStatus, CandidateType, EvolutionAction, StorageError,
};
use aidd_e2e_tests::{TestDataFactory, TestDatabaseManager};

#[test]
fn test_review_apply_revert_cycle() {
    let db = TestDatabaseManager::new_temp();
    let tracker = db.evolution();

    let candidate = TestDataFactory::candidate(
        &tracker,
        CandidateType::RuleElevation,
        "Always run lint before commit",
        75.0,
    );
    assert_eq!(candidate.status, CandidateStatus::Pending);

    let approved = tracker.approve(&candidate.id).unwrap();
    assert_eq!(approved.status, CandidateStatus::Approved);

    let applied = tracker
        .apply(&candidate.id, Some("# Rules\n- lint sometimes\n"))
        .unwrap();
    assert_eq!(applied.status, CandidateStatus::Applied);

    let reverted = tracker.revert(&candidate.id).unwrap();
    assert_eq!(reverted.candidate.status, CandidateStatus::Reverted);
    assert_eq!(
        reverted.restored_content.as_deref(),
        Some("# Rules\n- lint sometimes\n")
    );

    // Reverted is terminal for revert
    assert!(matches!(
        tracker.revert(&candidate.id),
        Err(StorageError::Validation(_))
    ));

    let actions: Vec<EvolutionAction> = tracker
        .list_log(Some(&candidate.id), 10)
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    for expected in [
        EvolutionAction::Proposed,
        EvolutionAction::Approved,
        EvolutionAction::Applied,
        EvolutionAction::Reverted,
    ] {
        assert!(actions.contains(&expected), "missing {:?}", expected);
    }
}

#[test]
fn test_auto_apply_only_touches_confident_pending_candidates() {
    let db = TestDatabaseManager::new_temp();
    let tracker = db.evolution();

    let confident =
        TestDataFactory::candidate(&tracker, CandidateType::PatternBan, "Ban any casts", 95.0);
    let unsure =
        TestDataFactory::candidate(&tracker, CandidateType::SkillUpdate, "Refresh the testing skill", 60.0);

    let applied = tracker.auto_apply(90.0).unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].id, confident.id);

    let status = tracker.status().unwrap();
    assert_eq!(status.applied, 1);
    assert_eq!(status.auto_applied, 1);
    assert_eq!(status.pending, 1);

    let pending = tracker
        .list_candidates(&CandidateFilter {
            status: Some(CandidateStatus::Pending),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, unsure.id);
}

#[test]
fn test_deleting_a_convention_decays_matching_candidates() {
    let db = TestDatabaseManager::new_temp();
    let memory = db.memory();
    let tracker = db.evolution();

    let convention = TestDataFactory::convention(&memory, "use named exports for components");

    let strong = TestDataFactory::candidate(
        &tracker,
        CandidateType::NewConvention,
        "use named exports for components",
        80.0,
    );
    let weak = TestDataFactory::candidate(
        &tracker,
        CandidateType::RuleElevation,
        "use named exports for all components",
        50.0,
    );
    let unrelated = TestDataFactory::candidate(
        &tracker,
        CandidateType::NewConvention,
        "prefer early returns",
        80.0,
    );
    // Pattern bans never decay, however similar
    let ban = TestDataFactory::candidate(
        &tracker,
        CandidateType::PatternBan,
        "use named exports for components",
        80.0,
    );

    let outcome = memory.delete(&convention.id).unwrap();
    let decay = outcome.decay.expect("convention deletion runs decay");
    assert_eq!(decay.decayed, vec![strong.id.clone()]);
    assert_eq!(decay.removed, vec![weak.id.clone()]);

    assert_eq!(tracker.get(&strong.id).unwrap().unwrap().confidence, 40.0);
    assert!(tracker.get(&weak.id).unwrap().is_none());
    assert_eq!(tracker.get(&unrelated.id).unwrap().unwrap().confidence, 80.0);
    assert_eq!(tracker.get(&ban.id).unwrap().unwrap().confidence, 80.0);

    // The removal stays visible in the log
    let log = tracker.list_log(Some(&weak.id), 10).unwrap();
    assert!(log.iter().any(|e| e.action == EvolutionAction::Removed));
}

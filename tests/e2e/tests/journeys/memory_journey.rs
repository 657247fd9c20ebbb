//! Journey: record permanent memory, hit the same error again, diagnose it
//! from history, then export everything for humans.

use aidd_core::{categorize_error, ErrorCategory, MemoryContent, MemoryKind, NewMemory};
use aidd_e2e_tests::{TestDataFactory, TestDatabaseManager};

#[test]
fn test_recurring_mistake_is_merged_and_found_again() {
    let db = TestDatabaseManager::new_temp();
    let memory = db.memory();

    TestDataFactory::seed_sample_mistakes(&memory);
    let first = TestDataFactory::mistake(&memory, "Cannot find module './utils/date'");

    // Same error with different casing and spacing
    let again = memory
        .save(NewMemory::Mistake {
            error: "  cannot find module './utils/date' ".to_string(),
            root_cause: "Moved file".to_string(),
            fix: "Update the import to '@/lib/date'".to_string(),
            prevention: "Use path aliases".to_string(),
        })
        .unwrap();

    assert!(again.duplicate);
    assert_eq!(again.entry.id, first.id);
    match &again.entry.content {
        MemoryContent::Mistake(m) => {
            assert_eq!(m.occurrences, 2);
            assert_eq!(m.fix, "Update the import to '@/lib/date'");
        }
        other => panic!("expected mistake, got {:?}", other.kind()),
    }

    let similar = memory
        .find_similar_mistakes("cannot find module utils/date", 0.2, 3)
        .unwrap();
    assert!(!similar.is_empty());
    assert_eq!(similar[0].entry.id, first.id);
    assert!(similar.windows(2).all(|w| w[0].score >= w[1].score));

    assert_eq!(memory.list(Some(MemoryKind::Mistake)).unwrap().len(), 7);
}

#[test]
fn test_error_categorization_matches_sample_errors() {
    let type_error = categorize_error("TypeError: Cannot read properties of undefined (reading 'map')");
    assert_eq!(type_error.category, ErrorCategory::Type);
    assert!(type_error.confidence > 0.0);

    let network = categorize_error("connect ECONNREFUSED 127.0.0.1:5432");
    assert_eq!(network.category, ErrorCategory::Network);

    let unknown = categorize_error("the moon is made of cheese");
    assert_eq!(unknown.category, ErrorCategory::Unknown);
    assert_eq!(unknown.confidence, 0.0);
}

#[test]
fn test_export_lists_every_kind() {
    let db = TestDatabaseManager::new_temp();
    let memory = db.memory();

    TestDataFactory::decision(&memory, "Use SQLite in WAL mode");
    TestDataFactory::mistake(&memory, "database is locked");
    TestDataFactory::convention(&memory, "Components use PascalCase file names");

    let export = memory.export().unwrap();
    assert_eq!(export.decisions.len(), 1);
    assert_eq!(export.mistakes.len(), 1);
    assert_eq!(export.conventions.len(), 1);

    let markdown = export.to_markdown();
    assert!(markdown.contains("## Decisions"));
    assert!(markdown.contains("Use SQLite in WAL mode"));
    assert!(markdown.contains("database is locked"));
    assert!(markdown.contains("Components use PascalCase file names"));

    let json = serde_json::to_value(&export).unwrap();
    assert!(json.get("generatedAt").is_some());
}

#[test]
fn test_memory_survives_reopen() {
    let mut db = TestDatabaseManager::new_temp();
    let saved = TestDataFactory::decision(&db.memory(), "Keep the CLI thin");

    db.reopen();

    let loaded = db.memory().get(&saved.id).unwrap().unwrap();
    assert_eq!(loaded.content, saved.content);
    assert_eq!(db.stats().decisions, 1);
}

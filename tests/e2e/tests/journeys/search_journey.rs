//! Journey: capture observations during sessions, then retrieve them with
//! the 3-layer search (index, timeline, full fetch).

use std::thread::sleep;
use std::time::Duration;

use aidd_core::{FullRecord, ObservationType, OrderBy, SearchOptions, SearchSource};
use aidd_e2e_tests::{TestDataFactory, TestDatabaseManager};

#[test]
fn test_search_then_timeline_then_fetch() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();
    let session = TestDataFactory::active_session(&sessions, "main");

    let mut ids = Vec::new();
    for (kind, title, narrative) in [
        (ObservationType::Insight, "Routing table layout", "Routes live in src/routes"),
        (ObservationType::Decision, "Adopt refresh tokens", "Access tokens expire after 15 minutes"),
        (ObservationType::Mistake, "Token refresh loop", "The interceptor retried the refresh call forever"),
        (ObservationType::Pattern, "Repository per aggregate", "Each aggregate owns one repository"),
    ] {
        ids.push(TestDataFactory::observation(&sessions, &session.id, kind, title, narrative).id);
        // Distinct timestamps keep the timeline deterministic
        sleep(Duration::from_millis(5));
    }
    let convention = TestDataFactory::convention(&db.memory(), "Never store refresh tokens in localStorage");

    let search = db.search();

    // Layer 1
    let hits = search.search("refresh", &SearchOptions::default()).unwrap();
    let hit_ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(hits.len(), 3);
    assert!(hit_ids.contains(&ids[1].as_str()));
    assert!(hit_ids.contains(&ids[2].as_str()));
    assert!(hit_ids.contains(&convention.id.as_str()));
    assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.relevance)));
    assert!(hits.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    let memory_hit = hits.iter().find(|h| h.id == convention.id).unwrap();
    assert_eq!(memory_hit.source, SearchSource::Memory);
    assert!(memory_hit.session_id.is_none());

    // Layer 2
    let timeline = search.get_timeline(&ids[2], 1).unwrap();
    assert!(timeline.anchor.found);
    assert_eq!(timeline.before.len(), 1);
    assert_eq!(timeline.before[0].id, ids[1]);
    assert_eq!(timeline.after.len(), 1);
    assert_eq!(timeline.after[0].id, ids[3]);

    // Layer 3, in request order, skipping unknown ids
    let records = search
        .get_by_ids(&[convention.id.clone(), "missing".to_string(), ids[0].clone()])
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(matches!(&records[0], FullRecord::Memory(m) if m.id == convention.id));
    match &records[1] {
        FullRecord::Observation(o) => {
            assert_eq!(o.title, "Routing table layout");
            assert_eq!(o.session_id, session.id);
        }
        other => panic!("expected observation, got {}", other.id()),
    }
}

#[test]
fn test_search_ordering_and_paging() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();
    let session = TestDataFactory::active_session(&sessions, "main");

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            TestDataFactory::observation(
                &sessions,
                &session.id,
                ObservationType::ToolOutcome,
                &format!("migration step {}", i),
                "ran the migration",
            )
            .id,
        );
        sleep(Duration::from_millis(5));
    }

    let newest_first = db
        .search()
        .search(
            "migration",
            &SearchOptions {
                order_by: OrderBy::DateDesc,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(newest_first.first().map(|h| h.id.as_str()), Some(ids[4].as_str()));

    let page = db
        .search()
        .search(
            "migration",
            &SearchOptions {
                limit: 2,
                offset: 1,
                order_by: OrderBy::DateAsc,
            },
        )
        .unwrap();
    let page_ids: Vec<&str> = page.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(page_ids, vec![ids[1].as_str(), ids[2].as_str()]);
}

#[test]
fn test_hostile_queries_return_nothing_instead_of_failing() {
    let db = TestDatabaseManager::new_temp();
    let search = db.search();

    for query in ["", "   ", "\"", "title:foo AND (", "*"] {
        let hits = search.search(query, &SearchOptions::default()).unwrap();
        assert!(hits.is_empty(), "query {:?} returned hits", query);
    }

    let timeline = search.get_timeline("does-not-exist", 3).unwrap();
    assert!(!timeline.anchor.found);
    assert!(timeline.before.is_empty() && timeline.after.is_empty());
}

//! Journey: a session ends and the hook bus fans the event out to
//! subscribers, one of which keeps failing until its breaker opens.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aidd_core::{
    HookBus, HookBusConfig, HookEvent, MemoryStore, SessionOutcome, SubscriberState,
};
use aidd_e2e_tests::{TestDataFactory, TestDatabaseManager};
use chrono::Utc;

fn fast_config() -> HookBusConfig {
    HookBusConfig {
        max_retries: 1,
        backoff_base: Duration::ZERO,
        failure_threshold: 2,
        cooldown: chrono::Duration::minutes(5),
        dead_letter_cap: 10,
    }
}

#[tokio::test]
async fn test_session_end_refreshes_export_and_isolates_failures() {
    let db = TestDatabaseManager::new_temp();
    let sessions = db.sessions();
    TestDataFactory::convention(&db.memory(), "Keep handlers idempotent");

    let session = TestDataFactory::active_session(&sessions, "main");
    let ended = sessions
        .end(
            &session.id,
            Some(SessionOutcome {
                tests_passing: true,
                revert_count: 0,
                compliance_score: 88.0,
            }),
        )
        .unwrap();

    let export_path = db.path().with_file_name("memory-export.md");
    let mut bus = HookBus::new(fast_config());

    let storage = Arc::clone(&db.storage);
    let path = export_path.clone();
    bus.register("export", move |_event: HookEvent| {
        let storage = Arc::clone(&storage);
        let path = path.clone();
        async move {
            let export = MemoryStore::new(storage).export().map_err(|e| e.to_string())?;
            tokio::fs::write(&path, export.to_markdown())
                .await
                .map_err(|e| e.to_string())
        }
    });

    let broken_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&broken_calls);
    bus.register("webhook", move |_event: HookEvent| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), String>("endpoint unreachable".to_string())
        }
    });

    let event = HookEvent::SessionEnded {
        session_id: ended.id.clone(),
    };

    let report = bus.emit(event.clone()).await;
    assert_eq!(report.delivered, vec!["export".to_string()]);
    assert_eq!(report.failed, vec!["webhook".to_string()]);
    assert_eq!(broken_calls.load(Ordering::SeqCst), 2);

    let written = std::fs::read_to_string(&export_path).unwrap();
    assert!(written.contains("Keep handlers idempotent"));

    // Second exhausted delivery opens the breaker
    bus.emit(event.clone()).await;
    let status = bus.status();
    let webhook = status
        .subscribers
        .iter()
        .find(|s| s.name == "webhook")
        .unwrap();
    assert!(matches!(webhook.state, SubscriberState::Disabled { .. }));
    assert_eq!(status.dead_letter_count, 2);

    // While cooling down the subscriber is skipped, export still runs
    let calls_before = broken_calls.load(Ordering::SeqCst);
    let report = bus.emit(event.clone()).await;
    assert_eq!(report.skipped, vec!["webhook".to_string()]);
    assert_eq!(report.delivered, vec!["export".to_string()]);
    assert_eq!(broken_calls.load(Ordering::SeqCst), calls_before);

    // After the cooldown it is tried again
    let later = Utc::now() + chrono::Duration::minutes(6);
    let report = bus.emit_at(event, later).await;
    assert_eq!(report.failed, vec!["webhook".to_string()]);
    assert!(broken_calls.load(Ordering::SeqCst) > calls_before);

    let letters: Vec<_> = bus.dead_letters().collect();
    assert!(letters.iter().all(|l| l.subscriber == "webhook"));
    assert!(letters.iter().all(|l| l.error == "endpoint unreachable"));
}

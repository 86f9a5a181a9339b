//! EventStore interface tests.
//!
//! These tests verify the contract of the EventStore trait.
//! Each storage implementation should run these tests.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use uuid::Uuid;

use commission_ledger::events::LedgerEvent;
use commission_ledger::interfaces::{EventStore, NewEvent, StorageError};
use commission_ledger::model::AccountStatus;

/// Create a test event carrying `n` in its payload.
pub fn make_event(n: u32) -> LedgerEvent {
    LedgerEvent::ConfirmationChannelLinked {
        handle: format!("@handle{n}"),
        at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, n % 60).unwrap(),
    }
}

/// Create multiple unkeyed events.
pub fn make_events(count: u32) -> Vec<NewEvent> {
    (0..count).map(|n| NewEvent::new(make_event(n))).collect()
}

// =============================================================================
// EventStore::add tests
// =============================================================================

pub async fn test_add_single_event<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_add_single";
    let root = Uuid::new_v4();

    let pages = store
        .add(domain, root, 0, make_events(1))
        .await
        .expect("add should succeed");
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].sequence, 0);

    let events = store.get(domain, root).await.expect("get should succeed");
    assert_eq!(events.len(), 1, "should have 1 event");
    assert_eq!(events[0].event, make_event(0));
}

pub async fn test_add_empty_events<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_add_empty";
    let root = Uuid::new_v4();

    store
        .add(domain, root, 0, vec![])
        .await
        .expect("empty add should succeed");

    let events = store.get(domain, root).await.expect("get should succeed");
    assert!(events.is_empty(), "should have no events");
}

pub async fn test_add_sequential_batches<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_add_sequential";
    let root = Uuid::new_v4();

    store.add(domain, root, 0, make_events(2)).await.unwrap();
    let pages = store.add(domain, root, 2, make_events(3)).await.unwrap();
    assert_eq!(
        pages.iter().map(|p| p.sequence).collect::<Vec<_>>(),
        vec![2, 3, 4]
    );
    assert_eq!(store.get_next_sequence(domain, root).await.unwrap(), 5);
}

pub async fn test_add_sequence_conflict<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_add_conflict";
    let root = Uuid::new_v4();

    store.add(domain, root, 0, make_events(2)).await.unwrap();
    let err = store
        .add(domain, root, 1, make_events(1))
        .await
        .expect_err("stale sequence should fail");
    assert!(matches!(err, StorageError::SequenceConflict { .. }));
    assert!(err.is_retryable());

    let events = store.get(domain, root).await.unwrap();
    assert_eq!(events.len(), 2, "failed add must not append");
}

pub async fn test_add_is_atomic_on_duplicate_key<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_add_atomic";
    let root = Uuid::new_v4();
    let key = format!("atomic:{root}");

    store
        .add(domain, root, 0, vec![NewEvent::keyed(make_event(0), &key)])
        .await
        .unwrap();

    let err = store
        .add(
            domain,
            root,
            1,
            vec![
                NewEvent::new(make_event(1)),
                NewEvent::keyed(make_event(2), &key),
            ],
        )
        .await
        .expect_err("duplicate key should fail");
    assert!(matches!(err, StorageError::DuplicateKey { key: ref k } if *k == key));
    assert!(!err.is_retryable());
    assert_eq!(store.get(domain, root).await.unwrap().len(), 1);
}

pub async fn test_idempotency_key_is_global<S: EventStore + ?Sized>(store: &S) {
    let key = format!("global:{}", Uuid::new_v4());
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    store
        .add("test_key_a", first, 0, vec![NewEvent::keyed(make_event(0), &key)])
        .await
        .unwrap();
    let err = store
        .add("test_key_b", second, 0, vec![NewEvent::keyed(make_event(0), &key)])
        .await
        .expect_err("key is unique across streams");
    assert!(matches!(err, StorageError::DuplicateKey { .. }));

    let found = store.find_by_key(&key).await.unwrap().expect("key recorded");
    assert_eq!(found.domain, "test_key_a");
    assert_eq!(found.root, first);
    assert_eq!(found.page.sequence, 0);
    assert!(store.find_by_key("missing-key").await.unwrap().is_none());
}

// =============================================================================
// EventStore::get / get_from / list_roots tests
// =============================================================================

pub async fn test_get_from<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_get_from";
    let root = Uuid::new_v4();

    store.add(domain, root, 0, make_events(5)).await.unwrap();
    let tail = store.get_from(domain, root, 3).await.unwrap();
    assert_eq!(
        tail.iter().map(|p| p.sequence).collect::<Vec<_>>(),
        vec![3, 4]
    );
    assert!(store.get_from(domain, root, 9).await.unwrap().is_empty());
}

pub async fn test_get_unknown_stream<S: EventStore + ?Sized>(store: &S) {
    let root = Uuid::new_v4();
    assert!(store.get("test_unknown", root).await.unwrap().is_empty());
    assert_eq!(store.get_next_sequence("test_unknown", root).await.unwrap(), 0);
}

pub async fn test_list_roots<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_list_roots";
    let roots: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for root in &roots {
        store.add(domain, *root, 0, make_events(1)).await.unwrap();
    }
    store
        .add("test_list_other", Uuid::new_v4(), 0, make_events(1))
        .await
        .unwrap();

    let mut listed = store.list_roots(domain).await.unwrap();
    listed.sort();
    let mut expected = roots.clone();
    expected.sort();
    assert_eq!(listed, expected);
}

pub async fn test_events_round_trip<S: EventStore + ?Sized>(store: &S) {
    let domain = "test_round_trip";
    let root = Uuid::new_v4();
    let event = LedgerEvent::AccountStatusChanged {
        status: AccountStatus::Suspended,
        reason: Some("chargeback review".to_string()),
        at: Utc.with_ymd_and_hms(2025, 7, 4, 12, 30, 0).unwrap(),
    };

    store
        .add(domain, root, 0, vec![NewEvent::new(event.clone())])
        .await
        .unwrap();
    let pages = store.get(domain, root).await.unwrap();
    assert_eq!(pages[0].event, event);
    assert!(pages[0].idempotency_key.is_none());
}

// =============================================================================
// Concurrency tests
// =============================================================================

/// Many writers race for the same next sequence: exactly one wins.
pub async fn test_concurrent_writers_one_wins(store: Arc<dyn EventStore>) {
    let domain = "test_concurrent";
    let root = Uuid::new_v4();

    let tasks: Vec<_> = (0..20)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move { store.add(domain, root, 0, make_events(1)).await.map(|_| n) })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(e.is_retryable(), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.get(domain, root).await.unwrap().len(), 1);
}

/// Many writers race with the same idempotency key on distinct streams.
pub async fn test_concurrent_keyed_writers_one_wins(store: Arc<dyn EventStore>) {
    let key = format!("race:{}", Uuid::new_v4());

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                store
                    .add("test_keyed_race", Uuid::new_v4(), 0, vec![NewEvent::keyed(make_event(0), key)])
                    .await
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert!(matches!(e, StorageError::DuplicateKey { .. }), "unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

/// Run all EventStore contract tests against a store.
#[macro_export]
macro_rules! run_event_store_tests {
    ($store:expr) => {
        use $crate::storage::event_store_tests::*;

        let store: std::sync::Arc<dyn commission_ledger::interfaces::EventStore> = $store;

        test_add_single_event(store.as_ref()).await;
        println!("  test_add_single_event: PASSED");

        test_add_empty_events(store.as_ref()).await;
        println!("  test_add_empty_events: PASSED");

        test_add_sequential_batches(store.as_ref()).await;
        println!("  test_add_sequential_batches: PASSED");

        test_add_sequence_conflict(store.as_ref()).await;
        println!("  test_add_sequence_conflict: PASSED");

        test_add_is_atomic_on_duplicate_key(store.as_ref()).await;
        println!("  test_add_is_atomic_on_duplicate_key: PASSED");

        test_idempotency_key_is_global(store.as_ref()).await;
        println!("  test_idempotency_key_is_global: PASSED");

        test_get_from(store.as_ref()).await;
        println!("  test_get_from: PASSED");

        test_get_unknown_stream(store.as_ref()).await;
        println!("  test_get_unknown_stream: PASSED");

        test_list_roots(store.as_ref()).await;
        println!("  test_list_roots: PASSED");

        test_events_round_trip(store.as_ref()).await;
        println!("  test_events_round_trip: PASSED");

        test_concurrent_writers_one_wins(store.clone()).await;
        println!("  test_concurrent_writers_one_wins: PASSED");

        test_concurrent_keyed_writers_one_wins(store.clone()).await;
        println!("  test_concurrent_keyed_writers_one_wins: PASSED");
    };
}

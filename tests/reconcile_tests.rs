//! End-to-end tests for rebuilding the application indices.

mod common;

use boardkeeper::maintenance::{audit_indices, RetryPolicy};
use boardkeeper::{IndexReconciler, TreePath, TreeStore};
use common::{board_fixture, fixed_now, path, shared, FaultyTreeStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn reconciler(store: Arc<dyn TreeStore>, concurrency: usize) -> IndexReconciler {
    IndexReconciler::new(store, concurrency).with_retry_policy(RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
    })
}

async fn wait_until_exists(store: &dyn TreeStore, target: &TreePath) -> bool {
    for _ in 0..200 {
        if store.exists(target).await.unwrap() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Applications with drifted indices: a stale entry, a missing entry, an
/// index-only post node and an orphan.
fn drifted_board() -> Value {
    json!({
        "posts": {
            "p1": {"category": "garden", "applications": {"a1": true, "stale": true}},
            "p2": {"category": "moving"},
            "ghost": {"applications": {"a_ghost": true}}
        },
        "applications": {
            "a1": {"post": "p1", "applicant": "u1"},
            "a2": {"post": "p2", "applicant": "u1"},
            "a3": {"post": "p1", "applicant": "u2"},
            "a_ghost": {"post": "ghost", "applicant": "u2"},
            "a_orphan": {"post": "deleted_long_ago", "applicant": "u2"},
            "a_no_applicant": {"post": "p2"}
        },
        "users": {
            "u1": {"pushToken": "t1", "applications": {"a1": true, "a_gone": true}},
            "u2": {"pushToken": "t2"}
        }
    })
}

fn derived_board() -> Value {
    json!({
        "posts": {
            "p1": {"category": "garden", "applications": {"a1": true, "a3": true}},
            "p2": {"category": "moving", "applications": {"a2": true}}
        },
        "applications": {
            "a1": {"post": "p1", "applicant": "u1"},
            "a2": {"post": "p2", "applicant": "u1"},
            "a3": {"post": "p1", "applicant": "u2"}
        },
        "users": {
            "u1": {"pushToken": "t1", "applications": {"a1": true, "a2": true}},
            "u2": {"pushToken": "t2", "applications": {"a3": true}}
        }
    })
}

#[tokio::test]
async fn test_pass_rebuilds_exactly_the_derived_indices() {
    let store = shared(drifted_board());

    let report = reconciler(store.clone(), 8)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.cleared_posts, 2);
    assert_eq!(report.cleared_users, 1);
    assert_eq!(report.processed, 6);
    assert_eq!(report.indexed, 3);
    assert_eq!(report.deleted_orphaned, 2);
    assert_eq!(report.deleted_incomplete, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(store.snapshot(), derived_board());
}

#[tokio::test]
async fn test_second_pass_converges_to_same_state() {
    let store = shared(drifted_board());
    let reconciler = reconciler(store.clone(), 8);

    reconciler.run_pass(&CancellationToken::new()).await.unwrap();
    let first = store.snapshot();

    let second = reconciler.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.indexed, 3);
    assert_eq!(second.deleted_orphaned + second.deleted_incomplete, 0);
    assert_eq!(store.snapshot(), first);
}

#[tokio::test]
async fn test_result_does_not_depend_on_concurrency() {
    let sequential = shared(drifted_board());
    let parallel = shared(drifted_board());

    reconciler(sequential.clone(), 1)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();
    reconciler(parallel.clone(), 32)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sequential.snapshot(), parallel.snapshot());
}

#[tokio::test]
async fn test_orphan_is_deleted_without_index_entries() {
    let store = shared(json!({
        "applications": {"a1": {"post": "nope", "applicant": "u1"}},
        "users": {"u1": {"pushToken": "t1"}}
    }));

    let report = reconciler(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.deleted_orphaned, 1);
    assert_eq!(
        store.snapshot(),
        json!({"users": {"u1": {"pushToken": "t1"}}})
    );
}

#[tokio::test]
async fn test_audit_agrees_after_pass() {
    let store = shared(drifted_board());

    let before = audit_indices(store.as_ref()).await.unwrap();
    assert!(!before.is_consistent());
    assert_eq!(before.orphaned_applications, vec!["a_ghost", "a_orphan"]);
    assert_eq!(before.incomplete_applications, vec!["a_no_applicant"]);

    reconciler(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    let after = audit_indices(store.as_ref()).await.unwrap();
    assert!(after.is_consistent(), "{:?}", after);
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let store = Arc::new(FaultyTreeStore::with_data(board_fixture(fixed_now())));
    store.fail_writes_times("posts/p_live/applications/a_live", Some(2));

    let report = reconciler(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 0);
    assert_eq!(report.indexed, 4);
    assert!(store
        .exists(&path("posts/p_live/applications/a_live"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_persistent_failure_is_contained_to_one_application() {
    let store = Arc::new(FaultyTreeStore::with_data(board_fixture(fixed_now())));
    store.fail_writes_under("users/u2/applications/a_event");

    let report = reconciler(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.indexed, 3);
    let audit = audit_indices(store.as_ref()).await.unwrap();
    assert_eq!(
        audit.missing_entries,
        vec![
            "posts/p_past_event/applications/a_event",
            "users/u2/applications/a_event"
        ]
    );

    store.clear_faults();
    let retry = reconciler(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(retry.failed, 0);
    assert!(audit_indices(store.as_ref()).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_unreadable_applications_abort_the_pass() {
    let store = Arc::new(FaultyTreeStore::with_data(board_fixture(fixed_now())));
    store.fail_reads_of("applications");

    let result = reconciler(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_live_mode_indexes_applications_as_they_arrive() {
    let store = shared(json!({
        "posts": {"p1": {"category": "garden", "creationTime": 1000}},
        "applications": {"a_existing": {"post": "p1", "applicant": "u1"}},
        "users": {"u1": {"pushToken": "t1"}, "u2": {"pushToken": "t2"}}
    }));
    let cancel = CancellationToken::new();
    let live = Arc::new(reconciler(store.clone(), 4));
    let task = tokio::spawn(live.run_live(cancel.clone()));

    assert!(wait_until_exists(store.as_ref(), &path("users/u1/applications/a_existing")).await);

    let pushed = store
        .push(&path("applications"), json!({"post": "p1", "applicant": "u2"}))
        .await
        .unwrap();
    store
        .set(&path("applications/a_orphan"), json!({"post": "nope", "applicant": "u2"}))
        .await
        .unwrap();

    let entry = path("posts/p1/applications").child(&pushed);
    assert!(wait_until_exists(store.as_ref(), &entry).await);

    // The orphan is processed after the pushed application or concurrently;
    // wait for it to disappear before stopping.
    for _ in 0..200 {
        if !store.exists(&path("applications/a_orphan")).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    let report = task.await.unwrap().unwrap();
    assert!(report.indexed >= 2);
    assert!(report.deleted_orphaned >= 1);
    assert!(!store.exists(&path("applications/a_orphan")).await.unwrap());
    assert!(audit_indices(store.as_ref()).await.unwrap().is_consistent());
}

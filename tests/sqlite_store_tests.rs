//! Maintenance against the SQLite-backed tree, including reopening the
//! database between passes.

mod common;

use boardkeeper::maintenance::audit_indices;
use boardkeeper::{
    ExpiryPolicy, ExpiryScanner, IndexReconciler, SqliteTreeStore, TreePath, TreeStore,
};
use common::{board_fixture, fixed_now, path, POST_LIVE, POST_OLD, POST_UNDATED};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn open(dir: &TempDir) -> Arc<SqliteTreeStore> {
    Arc::new(SqliteTreeStore::new(dir.path().join("store.db")).unwrap())
}

#[tokio::test]
async fn test_import_scan_reconcile_and_reopen() {
    let dir = TempDir::new().unwrap();
    let now = fixed_now();

    {
        let store = open(&dir);
        store.set(&TreePath::root(), board_fixture(now)).await.unwrap();
        assert_eq!(
            store.get(&TreePath::root()).await.unwrap(),
            Some(board_fixture(now))
        );

        let report = ExpiryScanner::new(store.clone(), ExpiryPolicy::default())
            .run(now, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.posts_deleted(), 2);
        assert_eq!(report.applications_deleted(), 3);
    }

    let store = open(&dir);
    let posts: Vec<String> = store
        .children(&path("posts"))
        .await
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(posts, vec![POST_LIVE, POST_UNDATED]);
    assert!(!store.exists(&path("posts").child(POST_OLD)).await.unwrap());
    assert_eq!(
        store.get(&path("users/u2")).await.unwrap(),
        Some(json!({"pushToken": "token-u2"}))
    );

    // Damage the indices, then let a pass put them back.
    store
        .delete(&path("users/u1/applications"))
        .await
        .unwrap();
    store
        .set(&path("posts/p_undated/applications/bogus"), json!(true))
        .await
        .unwrap();
    assert!(!audit_indices(store.as_ref()).await.unwrap().is_consistent());

    IndexReconciler::new(store.clone(), 4)
        .run_pass(&CancellationToken::new())
        .await
        .unwrap();
    assert!(audit_indices(store.as_ref()).await.unwrap().is_consistent());
    assert_eq!(
        store.get(&path("users/u1/applications")).await.unwrap(),
        Some(json!({"a_live": true}))
    );
    assert!(!store
        .exists(&path("posts/p_undated/applications"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_live_reconcile_sees_inserts_from_another_connection() {
    let dir = TempDir::new().unwrap();
    let daemon_store = Arc::new(
        SqliteTreeStore::new(dir.path().join("store.db"))
            .unwrap()
            .with_watch_interval(Duration::from_millis(20)),
    );
    let client_store = open(&dir);
    client_store
        .set(
            &TreePath::root(),
            json!({
                "posts": {"p1": {"category": "garden", "creationTime": 1000}},
                "users": {"u1": {"pushToken": "t1"}}
            }),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(
        Arc::new(IndexReconciler::new(daemon_store.clone(), 2)).run_live(cancel.clone()),
    );

    // Give the reconciler time to subscribe before inserting.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let key = client_store
        .push(&path("applications"), json!({"post": "p1", "applicant": "u1"}))
        .await
        .unwrap();

    let entry = path("users/u1/applications").child(&key);
    let mut indexed = false;
    for _ in 0..300 {
        if client_store.exists(&entry).await.unwrap() {
            indexed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(indexed, "live reconciler never indexed {}", key);

    cancel.cancel();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.indexed, 1);
    assert!(client_store
        .exists(&path("posts/p1/applications").child(&key))
        .await
        .unwrap());
}

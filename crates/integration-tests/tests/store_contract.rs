//! JobStore contract, run against every adapter
//!
//! The in-memory store and the SQLite store must be interchangeable: claims
//! are exclusive, abandoned jobs are reclaimable and creation is idempotent.

mod common;

use common::TempDb;
use conductor_core::domain::{Job, JobState};
use conductor_core::port::JobStore;
use conductor_infra_memory::MemoryJobStore;
use std::sync::Arc;

const NOW: i64 = 1_700_000_000_000;

fn due_job(uid: &str) -> Job {
    let mut job = Job::new(uid, "deploy", NOW - 1_000);
    job.scheduled = NOW - 1_000;
    job
}

/// N replicas race to claim the same job: exactly one wins.
async fn check_at_most_once_claim(store: Arc<dyn JobStore>) {
    store.create(&due_job("contested")).await.unwrap();

    let mut handles = Vec::new();
    for replica in 0..16 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .claim("contested", &format!("replica-{replica}"), NOW, NOW + 60_000)
                .await
                .unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            winners.push(job.run_by);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one claim must succeed: {winners:?}");

    let stored = store.find("contested").await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Running);
    assert_eq!(stored.run_by, winners[0]);
    assert_eq!(stored.total_executions, 1);
}

/// A running job whose deadline passed is claimable again; the old holder's
/// lease no longer settles it.
async fn check_abandoned_reclaim(store: Arc<dyn JobStore>) {
    store.create(&due_job("abandoned")).await.unwrap();
    let first = store
        .claim("abandoned", "crashed", NOW, NOW + 1_000)
        .await
        .unwrap()
        .unwrap();

    assert!(store.claim("abandoned", "b", NOW + 1_000, NOW + 2_000).await.unwrap().is_none());
    assert_eq!(store.list_due(NOW + 1_001, 10).await.unwrap().len(), 1);

    let second = store
        .claim("abandoned", "b", NOW + 1_001, NOW + 61_001)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.total_executions, 2);

    let mut late = first.clone();
    late.finish(NOW + 1_500, "late result");
    assert!(!store.finalize(&late, "crashed").await.unwrap());

    let mut done = second.clone();
    done.finish(NOW + 2_000, "ok");
    assert!(store.finalize(&done, "b").await.unwrap());
    let stored = store.find("abandoned").await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Finished);
    assert_eq!(stored.result, "ok");
}

/// Creating an existing pending uid returns the stored job unchanged.
async fn check_idempotent_create(store: Arc<dyn JobStore>) {
    let mut original = due_job("once");
    original.data = "first".to_string();
    let stored = store.create(&original).await.unwrap();
    assert!(stored.inserted);
    assert_eq!(stored.job, original);

    // same uid and same millisecond, only the flag tells the two apart
    let mut duplicate = due_job("once");
    duplicate.data = "second".to_string();
    let stored = store.create(&duplicate).await.unwrap();
    assert!(!stored.inserted);
    assert_eq!(stored.job.data, "first");
}

/// The due view and next-due time agree with the rows' states.
async fn check_next_due(store: Arc<dyn JobStore>) {
    assert_eq!(store.next_due().await.unwrap(), None);

    let mut later = due_job("later");
    later.scheduled = NOW + 5_000;
    store.create(&later).await.unwrap();
    assert_eq!(store.next_due().await.unwrap(), Some(NOW + 5_000));

    store.create(&due_job("now")).await.unwrap();
    store.claim("now", "a", NOW, NOW + 3_000).await.unwrap().unwrap();
    // the running job's deadline is the earliest thing to look at
    assert_eq!(store.next_due().await.unwrap(), Some(NOW + 3_000));

    store.cancel_pending("later", NOW).await.unwrap().unwrap();
    assert_eq!(store.next_due().await.unwrap(), Some(NOW + 3_000));
}

#[tokio::test]
async fn test_memory_store_contract() {
    check_at_most_once_claim(Arc::new(MemoryJobStore::new())).await;
    check_abandoned_reclaim(Arc::new(MemoryJobStore::new())).await;
    check_idempotent_create(Arc::new(MemoryJobStore::new())).await;
    check_next_due(Arc::new(MemoryJobStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_memory_store_contract() {
    check_at_most_once_claim(common::memory_sqlite_store().await).await;
    check_abandoned_reclaim(common::memory_sqlite_store().await).await;
    check_idempotent_create(common::memory_sqlite_store().await).await;
    check_next_due(common::memory_sqlite_store().await).await;
}

/// File database with a real connection pool, so claims race across connections.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_file_store_concurrent_claims() {
    let db = TempDb::new();
    check_at_most_once_claim(db.store().await).await;

    let db = TempDb::new();
    check_abandoned_reclaim(db.store().await).await;

    println!("✅ Concurrent claims: exactly one winner per job");
}

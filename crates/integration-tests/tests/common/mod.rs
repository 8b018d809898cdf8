//! Shared harness: a full engine (store + in-process lock/pubsub + executor
//! + scheduler loop) wired the way the daemon wires it.

#![allow(dead_code)]

use conductor_core::application::{
    shutdown_channel, Executor, Handler, RetryPolicy, Scheduler, ShutdownSender,
};
use conductor_core::domain::{Job, JobState};
use conductor_core::port::time_provider::SystemTimeProvider;
use conductor_core::port::{Consumer, JobStore, TimeProvider};
use conductor_infra_memory::InMemoryPubSub;
use conductor_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Retry base delay small enough for tests to watch a full retry cycle
pub const TEST_RETRY_BASE_DELAY_MS: i64 = 20;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Engine {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<Executor>,
    pub scheduler: Arc<Scheduler>,
    shutdown: ShutdownSender,
    handle: JoinHandle<conductor_core::Result<()>>,
    cancellations: Box<dyn Consumer>,
}

impl Engine {
    /// Build a replica, register `handlers`, and start its scheduler loop.
    pub async fn start(
        replica: &str,
        store: Arc<dyn JobStore>,
        pubsub: &InMemoryPubSub,
        handlers: Vec<(&str, Arc<dyn Handler>)>,
    ) -> Self {
        let (executor, scheduler) = build(replica, Arc::clone(&store), pubsub);
        for (job_type, handler) in handlers {
            executor.register(job_type, handler).unwrap();
        }
        let cancellations = executor.subscribe_cancellations(pubsub).await;

        let (shutdown, token) = shutdown_channel();
        let runner = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { runner.run(token).await });

        Self {
            store,
            executor,
            scheduler,
            shutdown,
            handle,
            cancellations,
        }
    }

    pub async fn stop(self) {
        self.shutdown.shutdown();
        self.handle.await.unwrap().unwrap();
        self.cancellations.close().unwrap();
    }
}

pub fn handler<H: Handler + 'static>(handler: H) -> Arc<dyn Handler> {
    Arc::new(handler)
}

/// Executor and scheduler for `replica`, without starting the loop.
pub fn build(
    replica: &str,
    store: Arc<dyn JobStore>,
    pubsub: &InMemoryPubSub,
) -> (Arc<Executor>, Arc<Scheduler>) {
    let time: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let publisher = Arc::new(pubsub.clone());
    let retry = Arc::new(RetryPolicy::new(Arc::clone(&time), TEST_RETRY_BASE_DELAY_MS));
    let executor = Arc::new(Executor::new(
        replica,
        Arc::clone(&store),
        publisher.clone(),
        Arc::clone(&time),
        retry,
    ));
    let scheduler = Arc::new(Scheduler::new(store, Arc::clone(&executor), publisher, time));
    (executor, scheduler)
}

/// Poll the store until `uid` satisfies `done`.
pub async fn wait_for_job<F>(store: &Arc<dyn JobStore>, uid: &str, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let poll = async {
        loop {
            if let Some(job) = store.find(uid).await.unwrap() {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    match tokio::time::timeout(WAIT_TIMEOUT, poll).await {
        Ok(job) => job,
        Err(_) => panic!(
            "job {uid} did not reach the expected state, last seen: {:?}",
            store.find(uid).await.unwrap()
        ),
    }
}

pub async fn wait_for_state(store: &Arc<dyn JobStore>, uid: &str, state: JobState) -> Job {
    wait_for_job(store, uid, |job| job.state == state).await
}

/// SQLite database file removed on drop
pub struct TempDb {
    path: PathBuf,
}

impl TempDb {
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("conductor-{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    pub async fn store(&self) -> Arc<dyn JobStore> {
        let pool = create_pool(&self.url()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(SqliteJobStore::new(pool))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path.display()));
        }
    }
}

pub async fn memory_sqlite_store() -> Arc<dyn JobStore> {
    let pool = create_pool("sqlite::memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(SqliteJobStore::new(pool))
}

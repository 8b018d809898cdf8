//! End-to-end engine behavior: submit, run, retry, re-arm, cancel

mod common;

use async_trait::async_trait;
use common::{handler, wait_for_job, wait_for_state, Engine, TempDb};
use conductor_core::application::events::PUBSUB_TOPIC_STATE_CHANGE;
use conductor_core::application::{Handler, JobContext, ProgressReporter};
use conductor_core::domain::{Definition, Job, JobState, StateChange};
use conductor_core::error::AppError;
use conductor_core::port::{JobStore, MessageHandler, SubscribeOptions, Subscriber};
use conductor_infra_memory::{InMemoryPubSub, MemoryJobStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

struct Echo;

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, _ctx: JobContext, data: String, _reporter: ProgressReporter) -> anyhow::Result<String> {
        Ok(format!("echo {data}"))
    }
}

struct Failing;

#[async_trait]
impl Handler for Failing {
    async fn handle(&self, _ctx: JobContext, _data: String, _reporter: ProgressReporter) -> anyhow::Result<String> {
        anyhow::bail!("boom")
    }
}

struct Panicking;

#[async_trait]
impl Handler for Panicking {
    async fn handle(&self, _ctx: JobContext, _data: String, _reporter: ProgressReporter) -> anyhow::Result<String> {
        panic!("handler bug")
    }
}

/// Runs until canceled
struct Blocking;

#[async_trait]
impl Handler for Blocking {
    async fn handle(&self, ctx: JobContext, _data: String, _reporter: ProgressReporter) -> anyhow::Result<String> {
        ctx.cancelled().await;
        anyhow::bail!("interrupted")
    }
}

/// Ignores cancellation and outlives any deadline
struct Sleepy;

#[async_trait]
impl Handler for Sleepy {
    async fn handle(&self, _ctx: JobContext, _data: String, _reporter: ProgressReporter) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".to_string())
    }
}

/// Reports half progress, then waits for the test to release it
struct Halfway {
    release: Arc<Notify>,
}

#[async_trait]
impl Handler for Halfway {
    async fn handle(&self, _ctx: JobContext, _data: String, reporter: ProgressReporter) -> anyhow::Result<String> {
        reporter.report(50, "halfway").await?;
        self.release.notified().await;
        Ok("done".to_string())
    }
}

/// Counts executions per uid
#[derive(Default)]
struct Counting {
    runs: Mutex<HashMap<String, usize>>,
}

#[async_trait]
impl Handler for Counting {
    async fn handle(&self, _ctx: JobContext, data: String, _reporter: ProgressReporter) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self.runs.lock().unwrap().entry(data).or_default() += 1;
        Ok(String::new())
    }
}

fn memory_store() -> Arc<dyn JobStore> {
    Arc::new(MemoryJobStore::new())
}

async fn state_changes(pubsub: &InMemoryPubSub) -> (Box<dyn conductor_core::port::Consumer>, mpsc::UnboundedReceiver<StateChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_change: MessageHandler = Arc::new(move |payload: Vec<u8>| {
        let change = StateChange::decode(&payload)?;
        tx.send(change)?;
        Ok(())
    });
    let consumer = pubsub
        .subscribe(PUBSUB_TOPIC_STATE_CHANGE, on_change, SubscribeOptions::default())
        .await;
    (consumer, rx)
}

#[tokio::test]
async fn test_submitted_job_runs_to_finished() {
    let pubsub = InMemoryPubSub::default();
    let (consumer, mut changes) = state_changes(&pubsub).await;
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![("echo", handler(Echo))]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "echo", "hello"))
        .await
        .unwrap();

    let job = wait_for_state(&engine.store, "job-1", JobState::Finished).await;
    assert_eq!(job.result, "echo hello");
    assert_eq!(job.total_executions, 1);
    assert_eq!(job.run_progress, 100);
    assert!(job.run_by.is_empty());

    let mut seen = Vec::new();
    while let Ok(Some(change)) = tokio::time::timeout(Duration::from_secs(2), changes.recv()).await {
        seen.push(change.state);
        if change.state == JobState::Finished {
            assert_eq!(change.result, "echo hello");
            break;
        }
    }
    assert_eq!(seen, vec![JobState::Scheduled, JobState::Running, JobState::Finished]);

    let progress = engine.scheduler.get_job_progress("job-1").await.unwrap();
    assert_eq!(progress.state, JobState::Finished);
    assert_eq!(progress.progress, 100);

    consumer.close().unwrap();
    engine.stop().await;
}

#[tokio::test]
async fn test_retry_exhaustion_fails_after_all_attempts() {
    let pubsub = InMemoryPubSub::default();
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![("fail", handler(Failing))]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "fail", "").with_max_retries(2))
        .await
        .unwrap();

    let job = wait_for_state(&engine.store, "job-1", JobState::Failed).await;
    assert_eq!(job.total_executions, 3);
    assert_eq!(job.consecutive_failures, 3);
    assert_eq!(job.last_failure_error, "boom");

    engine.stop().await;
}

#[tokio::test]
async fn test_panicking_handler_is_recovered() {
    let pubsub = InMemoryPubSub::default();
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![("panic", handler(Panicking))]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "panic", "").with_max_retries(1))
        .await
        .unwrap();

    let job = wait_for_state(&engine.store, "job-1", JobState::Failed).await;
    assert_eq!(job.total_executions, 2);
    assert!(
        job.last_failure_error.starts_with("job panicked: "),
        "unexpected error: {}",
        job.last_failure_error
    );

    // the replica keeps working after a panic
    engine.executor.register("echo", handler(Echo)).unwrap();
    engine
        .scheduler
        .submit(Definition::new("job-2", "echo", "still alive"))
        .await
        .unwrap();
    wait_for_state(&engine.store, "job-2", JobState::Finished).await;

    engine.stop().await;
}

#[tokio::test]
async fn test_unknown_job_type_fails() {
    let pubsub = InMemoryPubSub::default();
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "nobody-handles-this", "").with_max_retries(5))
        .await
        .unwrap();

    let job = wait_for_state(&engine.store, "job-1", JobState::Failed).await;
    assert_eq!(
        job.last_failure_error,
        "no handler registered for job type nobody-handles-this"
    );
    assert_eq!(job.total_executions, 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_deadline_exceeded_fails_the_job() {
    let pubsub = InMemoryPubSub::default();
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![("sleepy", handler(Sleepy))]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "sleepy", "").with_timeout(Duration::from_secs(1)))
        .await
        .unwrap();

    let job = wait_for_state(&engine.store, "job-1", JobState::Failed).await;
    assert_eq!(job.last_failure_error, "job deadline exceeded");
    assert_eq!(job.consecutive_failures, 1);

    engine.stop().await;
}

#[tokio::test]
async fn test_recurring_job_rearms_after_success() {
    let pubsub = InMemoryPubSub::default();
    let store = memory_store();

    // due right away, so the test does not wait for the next minute
    let now = now_millis();
    let job = Job::new_recurring("tick", "echo", "* * * * *", Duration::from_secs(30), now, now);
    store.upsert_recurring(&job).await.unwrap();

    let engine = Engine::start("replica-a", Arc::clone(&store), &pubsub, vec![("echo", handler(Echo))]).await;

    let job = wait_for_job(&engine.store, "tick", |job| job.total_executions == 1 && job.state == JobState::Scheduled).await;
    assert!(job.is_recurring);
    assert!(job.scheduled > job.last_executed);
    assert_eq!(job.scheduled % 60_000, 0, "re-armed on a minute boundary");
    assert_eq!(job.result, "echo ");

    engine.stop().await;
}

#[tokio::test]
async fn test_recurring_job_rearms_after_failure() {
    let pubsub = InMemoryPubSub::default();
    let store = memory_store();
    let now = now_millis();
    let job = Job::new_recurring("tick", "fail", "* * * * *", Duration::from_secs(30), now, now);
    store.upsert_recurring(&job).await.unwrap();

    let engine = Engine::start("replica-a", Arc::clone(&store), &pubsub, vec![("fail", handler(Failing))]).await;

    let job = wait_for_job(&engine.store, "tick", |job| job.total_executions == 1 && job.state == JobState::Scheduled).await;
    assert_eq!(job.consecutive_failures, 0);
    assert_eq!(job.last_failure_error, "boom");
    assert!(job.scheduled > job.last_executed);

    engine.stop().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let pubsub = InMemoryPubSub::default();
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![("block", handler(Blocking))]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "block", ""))
        .await
        .unwrap();
    wait_for_state(&engine.store, "job-1", JobState::Running).await;
    wait_for(|| engine.executor.is_running("job-1")).await;

    engine.scheduler.cancel_job("job-1").await.unwrap();

    let job = wait_for_state(&engine.store, "job-1", JobState::Canceled).await;
    assert_eq!(job.total_executions, 1);
    assert_eq!(engine.executor.running_count(), 0);

    engine.stop().await;
}

#[tokio::test]
async fn test_cancel_from_another_replica() {
    let pubsub = InMemoryPubSub::default();
    let store = memory_store();
    let worker = Engine::start("replica-a", Arc::clone(&store), &pubsub, vec![("block", handler(Blocking))]).await;

    worker
        .scheduler
        .submit(Definition::new("job-1", "block", ""))
        .await
        .unwrap();
    wait_for(|| worker.executor.is_running("job-1")).await;

    // a second replica that is not running the job
    let (_executor, client) = common::build("replica-b", Arc::clone(&store), &pubsub);

    client.cancel_job("job-1").await.unwrap();
    wait_for_state(&store, "job-1", JobState::Canceled).await;

    worker.stop().await;
}

#[tokio::test]
async fn test_cancel_pending_and_progress() {
    let pubsub = InMemoryPubSub::default();
    let store = memory_store();
    let (_executor, scheduler) = common::build("replica-a", Arc::clone(&store), &pubsub);

    // no loop running, so the job stays pending
    scheduler.submit(Definition::new("job-1", "echo", "")).await.unwrap();
    let progress = scheduler.get_job_progress("job-1").await.unwrap();
    assert_eq!(progress.state, JobState::Scheduled);

    scheduler.cancel_job("job-1").await.unwrap();
    let progress = scheduler.get_job_progress("job-1").await.unwrap();
    assert_eq!(progress.state, JobState::Canceled);

    // canceling a completed job is a no-op
    scheduler.cancel_job("job-1").await.unwrap();

    assert!(matches!(
        scheduler.cancel_job("missing").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        scheduler.get_job_progress("missing").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_idempotent_submission() {
    let pubsub = InMemoryPubSub::default();
    let store = memory_store();
    let (_executor, scheduler) = common::build("replica-a", Arc::clone(&store), &pubsub);

    let first = scheduler.submit(Definition::new("job-1", "echo", "first")).await.unwrap();
    let second = scheduler.submit(Definition::new("job-1", "echo", "second")).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(second.data, "first");

    let invalid = scheduler.submit(Definition::new("", "echo", "")).await.unwrap_err();
    assert!(invalid.is_validation());
}

#[tokio::test]
async fn test_progress_is_visible_while_running() {
    let pubsub = InMemoryPubSub::default();
    let release = Arc::new(Notify::new());
    let halfway = handler(Halfway { release: Arc::clone(&release) });
    let engine = Engine::start("replica-a", memory_store(), &pubsub, vec![("half", halfway)]).await;

    engine
        .scheduler
        .submit(Definition::new("job-1", "half", ""))
        .await
        .unwrap();

    let job = wait_for_job(&engine.store, "job-1", |job| job.run_progress == 50).await;
    assert_eq!(job.state, JobState::Running);
    let progress = engine.scheduler.get_job_progress("job-1").await.unwrap();
    assert_eq!(progress.progress, 50);
    assert_eq!(progress.result, "halfway");

    release.notify_one();
    let job = wait_for_state(&engine.store, "job-1", JobState::Finished).await;
    assert_eq!(job.result, "done");
    assert_eq!(job.run_progress, 100);

    engine.stop().await;
}

/// Two replicas share one SQLite file: every job runs exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_replicas_run_each_job_once() {
    let db = TempDb::new();
    let pubsub = InMemoryPubSub::default();
    let counter = Arc::new(Counting::default());
    let shared: Arc<dyn Handler> = counter.clone();

    let a = Engine::start("replica-a", db.store().await, &pubsub, vec![("count", Arc::clone(&shared))]).await;
    let b = Engine::start("replica-b", db.store().await, &pubsub, vec![("count", shared)]).await;

    for i in 0..20 {
        let submitter = if i % 2 == 0 { &a } else { &b };
        submitter
            .scheduler
            .submit(Definition::new(format!("job-{i}"), "count", format!("job-{i}")))
            .await
            .unwrap();
    }

    for i in 0..20 {
        let job = wait_for_state(&a.store, &format!("job-{i}"), JobState::Finished).await;
        assert_eq!(job.total_executions, 1);
    }

    let runs = counter.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), 20);
    assert!(runs.values().all(|count| *count == 1), "duplicate executions: {runs:?}");

    a.stop().await;
    b.stop().await;
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(common::WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

// Executor - runs claimed jobs and settles their outcome

mod handler;
mod panic_guard;

pub use handler::{Handler, JobContext, ProgressReporter};
pub use panic_guard::{guard_join, PanicGuardResult};

use crate::application::events::{publish_state_change, PUBSUB_TOPIC_CANCEL_JOB};
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::scheduler::cron::CronCache;
use crate::domain::{Job, JobState, JobUid, ReplicaId};
use crate::error::{AppError, Result};
use crate::port::{
    Consumer, JobStore, MessageHandler, Publisher, SubscribeOptions, Subscriber, TimeProvider,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a single execution ended, before retry rules are applied
#[derive(Debug)]
enum Outcome {
    Succeeded(String),
    Errored(String),
    DeadlineExceeded,
    Canceled,
}

/// Runs jobs claimed by this replica.
///
/// Every execution runs in its own task, raced against the job deadline and
/// its cancellation token. The settled row is written back with a
/// lease-guarded `finalize` and broadcast as a state change.
pub struct Executor {
    replica: ReplicaId,
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn Publisher>,
    time_provider: Arc<dyn TimeProvider>,
    retry_policy: Arc<RetryPolicy>,
    crons: Arc<CronCache>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    running: Arc<Mutex<HashMap<JobUid, CancellationToken>>>,
}

impl Executor {
    pub fn new(
        replica: impl Into<ReplicaId>,
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn Publisher>,
        time_provider: Arc<dyn TimeProvider>,
        retry_policy: Arc<RetryPolicy>,
    ) -> Self {
        Self {
            replica: replica.into(),
            store,
            publisher,
            time_provider,
            retry_policy,
            crons: Arc::new(CronCache::default()),
            handlers: RwLock::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Parsed cron schedules, shared with the scheduler
    pub fn crons(&self) -> Arc<CronCache> {
        Arc::clone(&self.crons)
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Register the handler for `job_type`.
    ///
    /// # Errors
    /// `AppError::Config` if the type already has a handler.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        let job_type = job_type.into();
        if job_type.is_empty() {
            return Err(AppError::Validation(
                "job type must not be empty".to_string(),
            ));
        }

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&job_type) {
            return Err(AppError::Config(format!(
                "handler already registered for job type {job_type}"
            )));
        }

        info!(job_type = %job_type, "Registered job handler");
        handlers.insert(job_type, handler);
        Ok(())
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handler(job_type).is_some()
    }

    fn handler(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    /// Number of executions currently in flight on this replica
    pub fn running_count(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_running(&self, uid: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(uid)
    }

    /// Cancel `uid` if this replica is running it. Returns whether it was.
    pub fn cancel_local(&self, uid: &str) -> bool {
        cancel_running(&self.running, uid)
    }

    /// Listen for cancellation requests broadcast by any replica.
    pub async fn subscribe_cancellations(&self, subscriber: &dyn Subscriber) -> Box<dyn Consumer> {
        let running = Arc::clone(&self.running);
        let on_cancel: MessageHandler = Arc::new(move |payload: Vec<u8>| {
            let uid = String::from_utf8(payload)?;
            if cancel_running(&running, &uid) {
                info!(job_uid = %uid, "Cancellation requested for running job");
            }
            Ok(())
        });

        subscriber
            .subscribe(PUBSUB_TOPIC_CANCEL_JOB, on_cancel, SubscribeOptions::default())
            .await
    }

    /// Run a job this replica has claimed and return the row as settled.
    ///
    /// The returned job is `Scheduled` when it should run again (retry or
    /// recurring re-arm); its `scheduled` field then carries the new due time.
    pub async fn execute(&self, job: Job) -> Job {
        let Some(handler) = self.handler(&job.job_type) else {
            warn!(job_uid = %job.uid, job_type = %job.job_type, "No handler registered");
            let reason = format!("no handler registered for job type {}", job.job_type);
            return self.settle(job, Outcome::Errored(reason), true).await;
        };

        publish_state_change(self.publisher.as_ref(), &job).await;

        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.uid.clone(), token.clone());

        let outcome = self.run_handler(&job, handler, &token).await;

        // wakes handlers still holding the context, then forget the execution
        token.cancel();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job.uid);

        self.settle(job, outcome, false).await
    }

    async fn run_handler(
        &self,
        job: &Job,
        handler: Arc<dyn Handler>,
        token: &CancellationToken,
    ) -> Outcome {
        let now = self.time_provider.now_millis();
        let remaining = Duration::from_millis(job.run_deadline.saturating_sub(now).max(0) as u64);

        let ctx = JobContext::new(&job.uid, &job.job_type, job.run_deadline, token.clone());
        let reporter = ProgressReporter::new(
            &job.uid,
            &job.job_type,
            &self.replica,
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
            Arc::clone(&self.time_provider),
        );
        let data = job.data.clone();

        info!(job_uid = %job.uid, job_type = %job.job_type, attempt = %job.total_executions, "Executing job");

        let mut handle = tokio::spawn(async move { handler.handle(ctx, data, reporter).await });

        let outcome = tokio::select! {
            joined = &mut handle => match guard_join(joined) {
                PanicGuardResult::Completed(Ok(result)) => Outcome::Succeeded(result),
                PanicGuardResult::Completed(Err(_)) if token.is_cancelled() => Outcome::Canceled,
                PanicGuardResult::Completed(Err(e)) => Outcome::Errored(format!("{e:#}")),
                PanicGuardResult::Panicked(msg) => Outcome::Errored(format!("job panicked: {msg}")),
                PanicGuardResult::Aborted => Outcome::Canceled,
            },
            _ = sleep(remaining) => Outcome::DeadlineExceeded,
            _ = token.cancelled() => Outcome::Canceled,
        };

        if !handle.is_finished() {
            handle.abort();
        }
        outcome
    }

    /// Apply the settle rules, persist the row and broadcast the outcome.
    async fn settle(&self, mut job: Job, outcome: Outcome, terminal: bool) -> Job {
        let now = self.time_provider.now_millis();

        match outcome {
            Outcome::Succeeded(result) => {
                info!(job_uid = %job.uid, "Job finished");
                job.finish(now, result);
            }
            Outcome::Errored(reason) => {
                job.record_failure(reason);
                let decision = if terminal {
                    RetryDecision::Failed
                } else {
                    self.retry_policy.should_retry(&job)
                };
                match decision {
                    RetryDecision::Retry(delay_ms) => {
                        self.retry_policy.prepare_for_retry(&mut job, delay_ms);
                    }
                    RetryDecision::Failed => {
                        error!(
                            job_uid = %job.uid,
                            failures = %job.consecutive_failures,
                            error = %job.last_failure_error,
                            "Job failed"
                        );
                        job.fail(now);
                    }
                }
            }
            Outcome::DeadlineExceeded => {
                warn!(job_uid = %job.uid, deadline = %job.run_deadline, "Job deadline exceeded");
                job.record_failure("job deadline exceeded");
                job.fail(now);
            }
            Outcome::Canceled => {
                info!(job_uid = %job.uid, "Job canceled");
                job.cancel(now);
            }
        }

        // the settled snapshot is what observers see, even when a recurring
        // job is re-armed right away
        let settled = job.clone();
        if job.is_recurring && job.state.is_completed() {
            self.rearm(&mut job, now);
        }

        match self.store.finalize(&job, &self.replica).await {
            Ok(true) => {
                publish_state_change(self.publisher.as_ref(), &settled).await;
                debug!(job_uid = %job.uid, state = %job.state, "Job settled");
            }
            Ok(false) => {
                warn!(
                    job_uid = %job.uid,
                    run_by = %self.replica,
                    "Job lease lost before settling, result discarded"
                );
            }
            Err(e) => {
                error!(job_uid = %job.uid, error = %e, "Failed to persist settled job");
            }
        }
        job
    }

    /// Put a completed recurring job back on its cron schedule.
    fn rearm(&self, job: &mut Job, now: i64) {
        match self.crons.next_after(&job.recurring_cron, now) {
            Ok(next) => {
                if job.state == JobState::Failed {
                    job.consecutive_failures = 0;
                }
                job.reschedule(now, next);
                debug!(job_uid = %job.uid, next = %next, "Recurring job re-armed");
            }
            Err(e) => {
                error!(job_uid = %job.uid, error = %e, "Cannot re-arm recurring job");
            }
        }
    }
}

fn cancel_running(running: &Mutex<HashMap<JobUid, CancellationToken>>, uid: &str) -> bool {
    match running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(uid)
    {
        Some(token) => {
            token.cancel();
            true
        }
        None => false,
    }
}

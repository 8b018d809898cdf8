//! Scheduler - wakes on the earliest due job and hands claimed jobs to the executor
//!
//! One loop per replica. Due times from submissions, retries and recurring
//! re-arms reach the loop through a bounded signal channel and can only move
//! the shared timer earlier; after every tick the timer is re-armed from the
//! store's own view of the next due job.

pub mod cron;
pub mod timer;

pub use self::cron::{CronCache, CronSchedule};
pub use timer::SchedulerTimer;

use crate::application::constants::{
    CLAIM_BATCH_SIZE, DEFAULT_BACKGROUND_POLL_INTERVAL, ERROR_RECOVERY_SLEEP_DURATION,
    IDLE_RECHECK_PERIOD, SIGNAL_CHANNEL_SIZE,
};
use crate::application::background::BackgroundService;
use crate::application::events::{publish_cancel, publish_state_change};
use crate::application::executor::Executor;
use crate::application::shutdown::ShutdownToken;
use crate::domain::{Definition, Job, JobState, Progress};
use crate::error::{AppError, Result};
use crate::port::{CreatedJob, JobStore, Publisher, TimeProvider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Handle used to tell the scheduler loop about a new due time
#[derive(Clone)]
pub struct DueNotifier {
    tx: mpsc::Sender<i64>,
}

impl DueNotifier {
    /// Non-blocking. When the channel is full the loop is already behind and
    /// will re-read the store on its next tick.
    pub fn notify(&self, at: i64) {
        if let Err(e) = self.tx.try_send(at) {
            debug!(at = %at, error = %e, "Due signal dropped");
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    publisher: Arc<dyn Publisher>,
    time_provider: Arc<dyn TimeProvider>,
    crons: Arc<CronCache>,
    notifier: DueNotifier,
    signals: Mutex<mpsc::Receiver<i64>>,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<Executor>,
        publisher: Arc<dyn Publisher>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_SIZE);
        Self {
            crons: executor.crons(),
            store,
            executor,
            publisher,
            time_provider,
            notifier: DueNotifier { tx },
            signals: Mutex::new(rx),
            batch_size: CLAIM_BATCH_SIZE,
        }
    }

    /// Max jobs claimed per tick
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn notifier(&self) -> DueNotifier {
        self.notifier.clone()
    }

    /// Create a one-shot job due immediately.
    ///
    /// Submitting a uid that is still pending or running returns the existing
    /// job unchanged.
    pub async fn submit(&self, definition: Definition) -> Result<Job> {
        definition.validate()?;

        let now = self.time_provider.now_millis();
        let job = definition.into_job(now);
        let CreatedJob {
            job: stored,
            inserted,
        } = self.store.create(&job).await?;

        if inserted {
            info!(job_uid = %stored.uid, job_type = %stored.job_type, "Job submitted");
            publish_state_change(self.publisher.as_ref(), &stored).await;
        } else {
            debug!(job_uid = %stored.uid, state = %stored.state, "Job already exists");
        }

        if stored.state == JobState::Scheduled {
            self.notifier.notify(stored.scheduled);
        }
        Ok(stored)
    }

    /// Register (or refresh) a recurring job. Safe to call on every start.
    pub async fn add_recurring(
        &self,
        uid: &str,
        job_type: &str,
        cron_expr: &str,
        max_duration: Duration,
    ) -> Result<()> {
        if uid.is_empty() || job_type.is_empty() {
            return Err(AppError::Validation(
                "recurring job needs a uid and a type".to_string(),
            ));
        }

        let schedule = self.crons.get_or_parse(cron_expr)?;
        let now = self.time_provider.now_millis();
        let first_run = schedule.next_after(now).ok_or_else(|| {
            AppError::Validation(format!("cron expression {cron_expr} never fires"))
        })?;

        let job = Job::new_recurring(
            uid,
            job_type,
            schedule.expression(),
            max_duration,
            first_run,
            now,
        );
        let stored = self.store.upsert_recurring(&job).await?;

        info!(
            job_uid = %stored.uid,
            cron = %stored.recurring_cron,
            next_run = %stored.scheduled,
            "Recurring job registered"
        );
        if stored.state == JobState::Scheduled {
            self.notifier.notify(stored.scheduled);
        }
        Ok(())
    }

    /// Cancel a job wherever it is.
    ///
    /// A job that has not been claimed yet is canceled in the store; a running
    /// one is canceled by whichever replica runs it.
    pub async fn cancel_job(&self, uid: &str) -> Result<()> {
        let now = self.time_provider.now_millis();
        if let Some(job) = self.store.cancel_pending(uid, now).await? {
            info!(job_uid = %uid, "Pending job canceled");
            publish_state_change(self.publisher.as_ref(), &job).await;
            return Ok(());
        }

        match self.store.find(uid).await? {
            Some(job) if job.state == JobState::Running => {
                publish_cancel(self.publisher.as_ref(), uid).await?;
                info!(job_uid = %uid, run_by = %job.run_by, "Cancellation broadcast");
                Ok(())
            }
            Some(job) => {
                debug!(job_uid = %uid, state = %job.state, "Nothing to cancel");
                Ok(())
            }
            None => Err(AppError::NotFound(format!("job {uid}"))),
        }
    }

    pub async fn get_job_progress(&self, uid: &str) -> Result<Progress> {
        self.store
            .find(uid)
            .await?
            .map(|job| job.to_progress())
            .ok_or_else(|| AppError::NotFound(format!("job {uid}")))
    }

    /// Run the scheduling loop until `shutdown` fires.
    ///
    /// Store errors never end the loop; they are logged and the tick retried
    /// after a back-off.
    pub async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        let mut signals = self.signals.lock().await;
        let mut timer = SchedulerTimer::new();

        let now = self.time_provider.now_millis();
        timer.reset_at(now, Some(now), false);

        info!(replica = %self.executor.replica(), "Scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Scheduler shutting down");
                    break;
                }
                Some(at) = signals.recv() => {
                    let now = self.time_provider.now_millis();
                    let wait = timer.reschedule_earlier(now, Some(at));
                    if !wait.is_zero() {
                        debug!(wait_ms = %wait.as_millis(), "Scheduler timer moved earlier");
                    }
                }
                _ = timer.fired() => {
                    self.tick(&mut timer).await;
                }
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// One pass of the loop. Returns the wait the timer was armed for.
    async fn tick(&self, timer: &mut SchedulerTimer) -> Duration {
        let now = self.time_provider.now_millis();
        let back_off = now + millis(ERROR_RECOVERY_SLEEP_DURATION);

        let outcome = match self.process_ready_jobs(now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Failed to process ready jobs");
                return timer.reset_at(now, Some(back_off), false);
            }
        };

        // a due job left unclaimed keeps next_due in the past
        if outcome.deferred > 0 {
            let wait = timer.reset_at(now, Some(back_off), false);
            debug!(deferred = %outcome.deferred, wait_ms = %wait.as_millis(), "Due jobs deferred, backing off");
            return wait;
        }

        match self.store.next_due().await {
            Ok(next) => {
                let next = next.unwrap_or(now + millis(IDLE_RECHECK_PERIOD));
                let wait = timer.reset_at(now, Some(next), outcome.full_batch);
                debug!(wait_ms = %wait.as_millis(), edgy = %outcome.full_batch, "Scheduler timer armed");
                wait
            }
            Err(e) => {
                error!(error = %e, "Failed to read next due time");
                timer.reset_at(now, Some(back_off), false)
            }
        }
    }

    /// Claim due jobs and start their executions.
    pub async fn process_ready_jobs(&self, now: i64) -> Result<TickOutcome> {
        let due = self.store.list_due(now, self.batch_size).await?;
        let mut outcome = TickOutcome {
            full_batch: due.len() >= self.batch_size,
            deferred: 0,
        };

        for job in due {
            // still settling locally after its deadline
            if self.executor.is_running(&job.uid) {
                outcome.deferred += 1;
                continue;
            }

            let deadline = now + job.max_duration_millis();
            match self
                .store
                .claim(&job.uid, self.executor.replica(), now, deadline)
                .await
            {
                Ok(Some(claimed)) => {
                    if job.state == JobState::Running {
                        warn!(job_uid = %job.uid, previous = %job.run_by, "Reclaimed abandoned job");
                    }
                    self.spawn_execution(claimed);
                }
                Ok(None) => {
                    debug!(job_uid = %job.uid, "Job claimed by another replica");
                }
                Err(e) => {
                    warn!(job_uid = %job.uid, error = %e, "Failed to claim job");
                    outcome.deferred += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn spawn_execution(&self, job: Job) {
        let executor = Arc::clone(&self.executor);
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            let settled = executor.execute(job).await;
            if settled.state == JobState::Scheduled {
                notifier.notify(settled.scheduled);
            }
        });
    }
}

/// Result of one pass over the due jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// The batch was full, more jobs may be due
    pub full_batch: bool,
    /// Due jobs neither started here nor taken by another replica
    pub deferred: usize,
}

/// Runs the scheduler loop only on the replica holding the scheduler lease
pub struct SchedulerService {
    scheduler: Arc<Scheduler>,
    wait_for: Duration,
}

impl SchedulerService {
    pub const NAME: &'static str = "scheduler";

    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            wait_for: DEFAULT_BACKGROUND_POLL_INTERVAL,
        }
    }

    /// Pause between leadership attempts
    pub fn with_wait_for(mut self, wait_for: Duration) -> Self {
        self.wait_for = wait_for;
        self
    }
}

#[async_trait]
impl BackgroundService for SchedulerService {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn wait_for(&self) -> Duration {
        self.wait_for
    }

    async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        self.scheduler.run(shutdown).await
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

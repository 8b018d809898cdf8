// Job Store Port (Interface)

use crate::domain::Job;
use crate::error::Result;
use async_trait::async_trait;

/// Row returned by [`JobStore::create`]
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedJob {
    pub job: Job,
    /// `false` when an existing pending or running row was returned instead
    pub inserted: bool,
}

/// Persistence contract consumed by the scheduler and executor.
///
/// All mutations are compare-and-set on a single row; the store is the only
/// cross-replica serialization point for job ownership.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    ///
    /// If a row with the same uid exists and is still pending or running it is
    /// returned unchanged. A completed row is overwritten by `job`.
    async fn create(&self, job: &Job) -> Result<CreatedJob>;

    /// Insert a recurring job or refresh type, cron and max duration of the
    /// existing row. The due time is replaced only when the cron expression
    /// changed and the row is not running.
    async fn upsert_recurring(&self, job: &Job) -> Result<Job>;

    /// Find job by uid
    async fn find(&self, uid: &str) -> Result<Option<Job>>;

    /// Jobs claimable at `now`: due scheduled rows and abandoned running rows,
    /// ordered by due time, elevated priority first on ties.
    async fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Job>>;

    /// Atomically transition a claimable job to running under `run_by`.
    ///
    /// Returns `None` when the job is no longer claimable (another replica won).
    async fn claim(
        &self,
        uid: &str,
        run_by: &str,
        now: i64,
        run_deadline: i64,
    ) -> Result<Option<Job>>;

    /// Persist progress while the job is still running under `run_by`.
    async fn update_progress(
        &self,
        uid: &str,
        run_by: &str,
        progress: i32,
        result: &str,
        now: i64,
    ) -> Result<bool>;

    /// Persist a settled job if it is still running under `run_by`.
    ///
    /// Returns `false` when the lease was lost to another replica.
    async fn finalize(&self, job: &Job, run_by: &str) -> Result<bool>;

    /// Cancel a job that has not been claimed yet.
    async fn cancel_pending(&self, uid: &str, now: i64) -> Result<Option<Job>>;

    /// Earliest moment any job becomes claimable.
    async fn next_due(&self) -> Result<Option<i64>>;

    /// Delete completed, non-recurring jobs last updated before `older_than`.
    async fn delete_old(&self, older_than: i64) -> Result<u64>;
}

// Maintenance - periodic purge of old completed jobs
// Runs as a regular recurring job so exactly one replica executes each occurrence

use crate::application::executor::{Handler, JobContext, ProgressReporter};
use crate::application::scheduler::Scheduler;
use crate::error::Result;
use crate::port::{JobStore, MutexManager, MutexOptions, TimeProvider};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Uid of the purge job
pub const JOB_UID_PURGE: &str = "conductor:jobs:purge";

/// Job type the purge handler is registered under
pub const JOB_TYPE_PURGE: &str = "conductor:jobs:purge";

/// Every 4 hours at 15 minutes past
pub const DEFAULT_PURGE_CRON: &str = "15 */4 * * *";

/// Lock serializing maintenance across replicas
pub const GLOBAL_LOCK_KEY: &str = "conductor:jobs:global";

/// Run deadline of one purge execution
pub const PURGE_MAX_DURATION: Duration = Duration::from_secs(60);

/// Handler deleting completed one-shot jobs older than the retention window
pub struct PurgeHandler {
    store: Arc<dyn JobStore>,
    mutex_manager: Arc<dyn MutexManager>,
    time_provider: Arc<dyn TimeProvider>,
    retention: Duration,
}

impl PurgeHandler {
    /// Create a purge handler
    ///
    /// # Arguments
    /// * `store` - Job store to delete from
    /// * `mutex_manager` - Provides the global maintenance lock
    /// * `time_provider` - Time provider
    /// * `retention` - Minimum age of a completed job before it is deleted
    pub fn new(
        store: Arc<dyn JobStore>,
        mutex_manager: Arc<dyn MutexManager>,
        time_provider: Arc<dyn TimeProvider>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            mutex_manager,
            time_provider,
            retention,
        }
    }

    /// Delete old jobs now, holding the global lock.
    pub async fn purge(&self, ctx: &JobContext) -> anyhow::Result<String> {
        let mx = self
            .mutex_manager
            .new_mutex(GLOBAL_LOCK_KEY, MutexOptions::default())?;
        if let Err(e) = mx.lock(ctx.token()).await {
            anyhow::bail!("failed to obtain the lock to clean up old jobs: {e}");
        }

        let older_than = self.time_provider.now_millis() - self.retention.as_millis() as i64;
        let deleted = self.store.delete_old(older_than).await;

        if let Err(e) = mx.unlock().await {
            error!(error = %e, "Failed to release global lock after cleaning up old jobs");
        }

        let deleted = match deleted {
            Ok(n) => n,
            Err(e) => anyhow::bail!("failed to purge old jobs: {e}"),
        };

        info!(deleted = deleted, older_than = older_than, "Old jobs purged");
        Ok(if deleted > 0 {
            format!("deleted {deleted} old jobs")
        } else {
            "no old jobs found".to_string()
        })
    }
}

#[async_trait]
impl Handler for PurgeHandler {
    async fn handle(
        &self,
        ctx: JobContext,
        _data: String,
        _reporter: ProgressReporter,
    ) -> anyhow::Result<String> {
        self.purge(&ctx).await
    }
}

/// Register the purge handler and its recurring job.
pub async fn register_purge(
    scheduler: &Scheduler,
    handler: PurgeHandler,
    cron_expr: &str,
) -> Result<()> {
    scheduler.executor().register(JOB_TYPE_PURGE, Arc::new(handler))?;
    scheduler
        .add_recurring(JOB_UID_PURGE, JOB_TYPE_PURGE, cron_expr, PURGE_MAX_DURATION)
        .await
}

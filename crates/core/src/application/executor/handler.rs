// Job handler contract, execution context and progress reporting

use crate::application::events::publish_progress;
use crate::domain::{JobUid, ReplicaId, PROGRESS_MAX, PROGRESS_MIN};
use crate::error::{AppError, Result};
use crate::port::{JobStore, Publisher, TimeProvider};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// User code run for a job type.
///
/// The returned string is stored as the job result. Returning an error counts
/// as a failed execution and goes through the retry policy.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: JobContext,
        data: String,
        reporter: ProgressReporter,
    ) -> anyhow::Result<String>;
}

/// Per-execution context handed to a [`Handler`]
#[derive(Clone, Debug)]
pub struct JobContext {
    pub uid: JobUid,
    pub job_type: String,
    /// Epoch ms after which the execution is abandoned
    pub deadline: i64,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        uid: impl Into<String>,
        job_type: impl Into<String>,
        deadline: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            uid: uid.into(),
            job_type: job_type.into(),
            deadline,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the job is canceled or has been settled by the executor.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Persists and broadcasts intermediate progress of a running job
#[derive(Clone)]
pub struct ProgressReporter {
    uid: JobUid,
    job_type: String,
    run_by: ReplicaId,
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn Publisher>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ProgressReporter {
    pub fn new(
        uid: impl Into<String>,
        job_type: impl Into<String>,
        run_by: impl Into<String>,
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn Publisher>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            uid: uid.into(),
            job_type: job_type.into(),
            run_by: run_by.into(),
            store,
            publisher,
            time_provider,
        }
    }

    /// Record `progress` (clamped to 0..=100) and an intermediate result.
    ///
    /// # Errors
    /// `AppError::Conflict` when this replica no longer owns the job.
    pub async fn report(&self, progress: i32, result: &str) -> Result<()> {
        let progress = progress.clamp(PROGRESS_MIN, PROGRESS_MAX);
        let now = self.time_provider.now_millis();

        let persisted = self
            .store
            .update_progress(&self.uid, &self.run_by, progress, result, now)
            .await?;
        if !persisted {
            return Err(AppError::Conflict(format!(
                "job {} is no longer running on {}",
                self.uid, self.run_by
            )));
        }

        debug!(job_uid = %self.uid, progress = %progress, "Job progress");
        publish_progress(
            self.publisher.as_ref(),
            &self.uid,
            &self.job_type,
            progress,
            result,
        )
        .await;
        Ok(())
    }
}

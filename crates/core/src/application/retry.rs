// Retry logic
use crate::application::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS,
};
use crate::port::time_provider::SystemTimeProvider;
use crate::domain::Job;
use crate::port::TimeProvider;
use std::sync::Arc;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the job (with backoff delay in ms)
    Retry(i64),
    /// Do not retry, job has failed permanently
    Failed,
}

/// Exponential backoff retry policy
///
/// Determines if a failed job should run again based on:
/// - Consecutive failure count (already incremented for the current failure)
/// - Maximum retries allowed by the job
/// - Backoff factor and ceiling of the policy
pub struct RetryPolicy {
    time_provider: Arc<dyn TimeProvider>,
    base_delay_ms: i64,
    max_delay_ms: i64,
    backoff_factor: f64,
}

impl RetryPolicy {
    /// Create a new retry policy with the default factor and ceiling
    ///
    /// # Arguments
    /// * `time_provider` - Time provider for current time
    /// * `base_delay_ms` - Delay before the first retry
    pub fn new(time_provider: Arc<dyn TimeProvider>, base_delay_ms: i64) -> Self {
        Self {
            time_provider,
            base_delay_ms: base_delay_ms.max(0),
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: i64) -> Self {
        self.max_delay_ms = max_delay_ms.max(self.base_delay_ms);
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    /// Determine if a job should be retried
    ///
    /// Backoff formula:
    /// delay = min(base_delay * factor ^ (failures - 1), max_delay) * (1.0 ± 0.1)
    ///
    /// # Example
    /// ```text
    /// job.record_failure("boom");
    /// match policy.should_retry(&job) {
    ///     RetryDecision::Retry(delay_ms) => policy.prepare_for_retry(&mut job, delay_ms),
    ///     RetryDecision::Failed => job.fail(now),
    /// }
    /// ```
    pub fn should_retry(&self, job: &Job) -> RetryDecision {
        if job.consecutive_failures > job.max_retries {
            warn!(
                job_uid = %job.uid,
                failures = %job.consecutive_failures,
                max_retries = %job.max_retries,
                "Max retries reached"
            );
            return RetryDecision::Failed;
        }

        let exponent = (job.consecutive_failures - 1).max(0);
        let raw_delay = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = raw_delay.min(self.max_delay_ms as f64);

        // ±10% jitter keyed on the uid so replicas agree on the delay
        let jitter_seed = job.uid.chars().map(|c| c as u32).sum::<u32>();
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0);

        let delay_ms = (capped * jitter_factor) as i64;

        info!(
            job_uid = %job.uid,
            failures = %job.consecutive_failures,
            max_retries = %job.max_retries,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );

        RetryDecision::Retry(delay_ms)
    }

    /// Put a failed job back into the schedule `delay_ms` from now
    pub fn prepare_for_retry(&self, job: &mut Job, delay_ms: i64) {
        let now = self.time_provider.now_millis();
        job.reschedule(now, now + delay_ms);
    }

    pub fn base_delay_ms(&self) -> i64 {
        self.base_delay_ms
    }

    /// Check if a job has exceeded its run deadline
    pub fn is_deadline_exceeded(&self, job: &Job) -> bool {
        let now = self.time_provider.now_millis();
        if now > job.run_deadline {
            warn!(
                job_uid = %job.uid,
                deadline = %job.run_deadline,
                now = %now,
                "Job deadline exceeded"
            );
            return true;
        }
        false
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Arc::new(SystemTimeProvider), DEFAULT_RETRY_BASE_DELAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::JobState;
    use crate::port::time_provider::ManualTimeProvider;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Arc::new(ManualTimeProvider::new(10_000)), 1000)
    }

    fn failing_job(max_retries: i32, failures: i32) -> Job {
        let mut job = Job::new("a", "deploy", 0);
        job.max_retries = max_retries;
        for _ in 0..failures {
            job.record_failure("boom");
        }
        job
    }

    #[test]
    fn test_retry_within_budget() {
        let policy = policy();
        assert!(matches!(
            policy.should_retry(&failing_job(2, 1)),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            policy.should_retry(&failing_job(2, 2)),
            RetryDecision::Retry(_)
        ));
        assert_eq!(policy.should_retry(&failing_job(2, 3)), RetryDecision::Failed);
        assert_eq!(policy.should_retry(&failing_job(0, 1)), RetryDecision::Failed);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = policy().with_max_delay(3000);

        let delay = |failures| match policy.should_retry(&failing_job(10, failures)) {
            RetryDecision::Retry(d) => d,
            RetryDecision::Failed => panic!("expected retry"),
        };

        let first = delay(1);
        let second = delay(2);
        assert!((900..=1100).contains(&first), "got {}", first);
        assert!((1800..=2200).contains(&second), "got {}", second);
        assert!(delay(8) <= 3300);
    }

    #[test]
    fn test_prepare_for_retry() {
        let policy = policy();
        let mut job = failing_job(3, 1);
        job.claim("replica", 0, 5_000).unwrap();

        policy.prepare_for_retry(&mut job, 500);
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.scheduled, 10_500);
        assert!(job.run_by.is_empty());
    }
}

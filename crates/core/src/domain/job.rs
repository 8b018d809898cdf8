// Job Domain Model

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::error::{DomainError, Result};

/// Job UID (caller-chosen idempotency key)
pub type JobUid = String;

/// Replica identity stored in `run_by`
pub type ReplicaId = String;

pub const PROGRESS_MIN: i32 = 0;
pub const PROGRESS_MAX: i32 = 100;

/// Shortest timeout a definition may request
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Job State
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Scheduled,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Scheduled,
        JobState::Running,
        JobState::Finished,
        JobState::Failed,
        JobState::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    /// Map a persisted value onto the enum.
    ///
    /// Returns the matching state and `true`, or the default state and `false`
    /// when the value is unknown. An empty value normalizes to the default and
    /// counts as known.
    pub fn normalize(raw: &str) -> (JobState, bool) {
        let raw = raw.trim();
        if raw.is_empty() {
            return (JobState::default(), true);
        }
        match Self::ALL.iter().find(|s| s.as_str().eq_ignore_ascii_case(raw)) {
            Some(state) => (*state, true),
            None => (JobState::default(), false),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Canceled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority (influences dispatch order between jobs due at the same time)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    Elevated,
}

impl Priority {
    pub fn as_i32(&self) -> i32 {
        match self {
            Priority::Normal => 0,
            Priority::Elevated => 1,
        }
    }

    /// Same contract as [`JobState::normalize`], for the persisted integer.
    pub fn normalize(raw: i32) -> (Priority, bool) {
        match raw {
            0 => (Priority::Normal, true),
            1 => (Priority::Elevated, true),
            _ => (Priority::default(), false),
        }
    }
}

/// Caller-facing request to create a one-shot job
#[derive(Debug, Clone)]
pub struct Definition {
    pub uid: JobUid,
    pub job_type: String,
    pub max_retries: i32,
    pub timeout: Duration,
    pub data: String,
    pub priority: Priority,
    pub group_id: Option<String>,
}

impl Definition {
    pub fn new(uid: impl Into<String>, job_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            job_type: job_type.into(),
            max_retries: 0,
            timeout: Duration::from_secs(60),
            data: data.into(),
            priority: Priority::Normal,
            group_id: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_type.is_empty() {
            return Err(DomainError::Validation(
                "job type must not be empty".to_string(),
            ));
        }
        if self.uid.is_empty() {
            return Err(DomainError::Validation(
                "job must have a unique identifier".to_string(),
            ));
        }
        if self.max_retries < 0 {
            return Err(DomainError::Validation(format!(
                "job max retries must not be negative, got {}",
                self.max_retries
            )));
        }
        if self.timeout < MIN_TIMEOUT {
            return Err(DomainError::Validation(format!(
                "job timeout too short: {:?}",
                self.timeout
            )));
        }
        Ok(())
    }

    /// Build the persisted job, due immediately.
    pub fn into_job(self, now_millis: i64) -> Job {
        let mut job = Job::new(self.uid, self.job_type, now_millis);
        job.priority = self.priority;
        job.data = self.data;
        job.max_duration_seconds = whole_seconds(self.timeout);
        job.max_retries = self.max_retries;
        job.group_id = self.group_id;
        job
    }
}

/// Job Entity (one row in the store)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uid: JobUid,
    pub created: i64, // epoch ms
    pub updated: i64,
    pub job_type: String,
    pub priority: Priority,
    pub data: String,
    pub result: String,
    pub max_duration_seconds: i64,
    pub max_retries: i32,
    pub state: JobState,
    pub scheduled: i64,
    pub total_executions: i32,
    pub run_by: ReplicaId,
    pub run_deadline: i64,
    pub run_progress: i32,
    pub last_executed: i64, // 0 = never
    pub is_recurring: bool,
    pub recurring_cron: String,
    pub consecutive_failures: i32,
    pub last_failure_error: String,
    pub group_id: Option<String>,
}

impl Job {
    /// Create a scheduled job due at `now_millis`.
    pub fn new(uid: impl Into<String>, job_type: impl Into<String>, now_millis: i64) -> Self {
        Self {
            uid: uid.into(),
            created: now_millis,
            updated: now_millis,
            job_type: job_type.into(),
            priority: Priority::Normal,
            data: String::new(),
            result: String::new(),
            max_duration_seconds: MIN_TIMEOUT.as_secs() as i64,
            max_retries: 0,
            state: JobState::Scheduled,
            scheduled: now_millis,
            total_executions: 0,
            run_by: String::new(),
            run_deadline: now_millis,
            run_progress: PROGRESS_MIN,
            last_executed: 0,
            is_recurring: false,
            recurring_cron: String::new(),
            consecutive_failures: 0,
            last_failure_error: String::new(),
            group_id: None,
        }
    }

    /// Create a recurring job whose first run is at `first_run`.
    pub fn new_recurring(
        uid: impl Into<String>,
        job_type: impl Into<String>,
        cron_expr: impl Into<String>,
        max_duration: Duration,
        first_run: i64,
        now_millis: i64,
    ) -> Self {
        let mut job = Self::new(uid, job_type, now_millis);
        job.is_recurring = true;
        job.recurring_cron = cron_expr.into();
        job.max_duration_seconds = whole_seconds(max_duration.max(MIN_TIMEOUT));
        job.scheduled = first_run;
        job
    }

    pub fn max_duration_millis(&self) -> i64 {
        self.max_duration_seconds.max(1) * 1000
    }

    /// Due `Scheduled` job, or `Running` job whose deadline passed (abandoned).
    pub fn is_claimable(&self, now_millis: i64) -> bool {
        match self.state {
            JobState::Scheduled => self.scheduled <= now_millis,
            JobState::Running => self.run_deadline < now_millis,
            _ => false,
        }
    }

    /// Transition to Running under `run_by`.
    pub fn claim(&mut self, run_by: &str, now_millis: i64, run_deadline: i64) -> Result<()> {
        if !self.is_claimable(now_millis) {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: JobState::Running.to_string(),
            });
        }
        self.state = JobState::Running;
        self.run_by = run_by.to_string();
        self.run_deadline = run_deadline;
        self.run_progress = PROGRESS_MIN;
        self.last_executed = now_millis;
        self.total_executions += 1;
        self.updated = now_millis;
        Ok(())
    }

    /// Successful completion.
    pub fn finish(&mut self, now_millis: i64, result: impl Into<String>) {
        self.state = JobState::Finished;
        self.result = result.into();
        self.run_progress = PROGRESS_MAX;
        self.consecutive_failures = 0;
        self.last_failure_error.clear();
        self.release(now_millis);
    }

    /// Record a failed execution without deciding what happens next.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures += 1;
        self.last_failure_error = error.into();
    }

    /// Terminal failure.
    pub fn fail(&mut self, now_millis: i64) {
        self.state = JobState::Failed;
        self.release(now_millis);
    }

    pub fn cancel(&mut self, now_millis: i64) {
        self.state = JobState::Canceled;
        self.release(now_millis);
    }

    /// Back to Scheduled, due at `at`.
    pub fn reschedule(&mut self, now_millis: i64, at: i64) {
        self.state = JobState::Scheduled;
        self.scheduled = at;
        self.release(now_millis);
    }

    fn release(&mut self, now_millis: i64) {
        self.run_by.clear();
        self.updated = now_millis;
    }

    pub fn to_progress(&self) -> Progress {
        Progress {
            state: self.state,
            progress: self.run_progress,
            result: self.result.clone(),
            failure: self.last_failure_error.clone(),
        }
    }
}

/// Wire event broadcast on every state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub uid: JobUid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub state: JobState,
    pub progress: i32,
    pub result: String,
    pub failure: String,
}

impl StateChange {
    pub fn from_job(job: &Job) -> Self {
        Self {
            uid: job.uid.clone(),
            job_type: job.job_type.clone(),
            state: job.state,
            progress: job.run_progress,
            result: job.result.clone(),
            failure: job.last_failure_error.clone(),
        }
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Durations are stored in whole seconds; a partial second rounds up so the
/// deadline is never shorter than requested.
fn whole_seconds(d: Duration) -> i64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Snapshot of a job's execution as seen by observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub state: JobState,
    pub progress: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure: String,
}

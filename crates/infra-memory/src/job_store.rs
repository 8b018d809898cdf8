// In-memory JobStore
// Every operation runs under one mutex, so each compare-and-set is atomic.

use async_trait::async_trait;
use conductor_core::domain::{Job, JobState};
use conductor_core::error::Result;
use conductor_core::port::{CreatedJob, JobStore};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<CreatedJob> {
        let mut jobs = self.jobs();
        if let Some(existing) = jobs.get(&job.uid) {
            if !existing.state.is_completed() {
                return Ok(CreatedJob {
                    job: existing.clone(),
                    inserted: false,
                });
            }
        }
        jobs.insert(job.uid.clone(), job.clone());
        Ok(CreatedJob {
            job: job.clone(),
            inserted: true,
        })
    }

    async fn upsert_recurring(&self, job: &Job) -> Result<Job> {
        let mut jobs = self.jobs();
        let Some(existing) = jobs.get_mut(&job.uid) else {
            jobs.insert(job.uid.clone(), job.clone());
            return Ok(job.clone());
        };

        if existing.state.is_completed() {
            existing.state = JobState::Scheduled;
            existing.scheduled = job.scheduled;
            existing.consecutive_failures = 0;
            existing.run_by.clear();
        } else if existing.recurring_cron != job.recurring_cron
            && existing.state != JobState::Running
        {
            existing.scheduled = job.scheduled;
        }

        existing.job_type = job.job_type.clone();
        existing.recurring_cron = job.recurring_cron.clone();
        existing.max_duration_seconds = job.max_duration_seconds;
        existing.is_recurring = true;
        existing.updated = job.updated;
        Ok(existing.clone())
    }

    async fn find(&self, uid: &str) -> Result<Option<Job>> {
        Ok(self.jobs().get(uid).cloned())
    }

    async fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Job>> {
        let mut due: Vec<Job> = self
            .jobs()
            .values()
            .filter(|job| job.is_claimable(now))
            .cloned()
            .collect();

        due.sort_by(|a, b| {
            a.scheduled
                .cmp(&b.scheduled)
                .then(b.priority.as_i32().cmp(&a.priority.as_i32()))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(
        &self,
        uid: &str,
        run_by: &str,
        now: i64,
        run_deadline: i64,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs();
        let Some(job) = jobs.get_mut(uid) else {
            return Ok(None);
        };
        if !job.is_claimable(now) {
            return Ok(None);
        }
        job.claim(run_by, now, run_deadline)?;
        Ok(Some(job.clone()))
    }

    async fn update_progress(
        &self,
        uid: &str,
        run_by: &str,
        progress: i32,
        result: &str,
        now: i64,
    ) -> Result<bool> {
        let mut jobs = self.jobs();
        match jobs.get_mut(uid) {
            Some(job) if job.state == JobState::Running && job.run_by == run_by => {
                job.run_progress = progress;
                job.result = result.to_string();
                job.updated = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&self, job: &Job, run_by: &str) -> Result<bool> {
        let mut jobs = self.jobs();
        match jobs.get_mut(&job.uid) {
            Some(existing) if existing.state == JobState::Running && existing.run_by == run_by => {
                *existing = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_pending(&self, uid: &str, now: i64) -> Result<Option<Job>> {
        let mut jobs = self.jobs();
        match jobs.get_mut(uid) {
            Some(job) if job.state == JobState::Scheduled && !job.is_recurring => {
                job.cancel(now);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn next_due(&self) -> Result<Option<i64>> {
        Ok(self
            .jobs()
            .values()
            .filter_map(|job| match job.state {
                JobState::Scheduled => Some(job.scheduled),
                JobState::Running => Some(job.run_deadline),
                _ => None,
            })
            .min())
    }

    async fn delete_old(&self, older_than: i64) -> Result<u64> {
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, job| {
            job.is_recurring || !job.state.is_completed() || job.updated >= older_than
        });
        Ok((before - jobs.len()) as u64)
    }
}

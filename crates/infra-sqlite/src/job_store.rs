// SQLite JobStore Implementation
//
// Every state transition is a single guarded statement, so concurrent
// replicas sharing one database file race on the WHERE clause, never on
// a read-modify-write in application code.

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use conductor_core::domain::{Job, JobState, Priority};
use conductor_core::error::Result;
use conductor_core::port::{CreatedJob, JobStore};
use sqlx::query::QueryAs;
use sqlx::sqlite::{Sqlite, SqliteArguments};
use sqlx::SqlitePool;
use tracing::warn;

const INSERT_JOB: &str = r#"
    INSERT INTO jobs (
        uid, created, updated, job_type, priority, data, result,
        max_duration_seconds, max_retries, state, scheduled, total_executions,
        run_by, run_deadline, run_progress, last_executed, is_recurring,
        recurring_cron, consecutive_failures, last_failure_error, group_id
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

// A completed row is replaced wholesale; a live one is left alone and
// RETURNING yields nothing.
const CREATE_CONFLICT: &str = r#"
    ON CONFLICT(uid) DO UPDATE SET
        created = excluded.created,
        updated = excluded.updated,
        job_type = excluded.job_type,
        priority = excluded.priority,
        data = excluded.data,
        result = excluded.result,
        max_duration_seconds = excluded.max_duration_seconds,
        max_retries = excluded.max_retries,
        state = excluded.state,
        scheduled = excluded.scheduled,
        total_executions = excluded.total_executions,
        run_by = excluded.run_by,
        run_deadline = excluded.run_deadline,
        run_progress = excluded.run_progress,
        last_executed = excluded.last_executed,
        is_recurring = excluded.is_recurring,
        recurring_cron = excluded.recurring_cron,
        consecutive_failures = excluded.consecutive_failures,
        last_failure_error = excluded.last_failure_error,
        group_id = excluded.group_id
    WHERE jobs.state IN ('finished', 'failed', 'canceled')
    RETURNING *
"#;

// SET expressions see the pre-update row, so the CASE arms all test the
// old state.
const RECURRING_CONFLICT: &str = r#"
    ON CONFLICT(uid) DO UPDATE SET
        scheduled = CASE
            WHEN jobs.state IN ('finished', 'failed', 'canceled') THEN excluded.scheduled
            WHEN jobs.recurring_cron <> excluded.recurring_cron AND jobs.state <> 'running'
                THEN excluded.scheduled
            ELSE jobs.scheduled
        END,
        consecutive_failures = CASE
            WHEN jobs.state IN ('finished', 'failed', 'canceled') THEN 0
            ELSE jobs.consecutive_failures
        END,
        run_by = CASE
            WHEN jobs.state IN ('finished', 'failed', 'canceled') THEN ''
            ELSE jobs.run_by
        END,
        state = CASE
            WHEN jobs.state IN ('finished', 'failed', 'canceled') THEN 'scheduled'
            ELSE jobs.state
        END,
        job_type = excluded.job_type,
        recurring_cron = excluded.recurring_cron,
        max_duration_seconds = excluded.max_duration_seconds,
        is_recurring = 1,
        updated = excluded.updated
    RETURNING *
"#;

type JobQuery<'q> = QueryAs<'q, Sqlite, JobRow, SqliteArguments<'q>>;

/// Bind every column of `job` in INSERT_JOB order
fn bind_job<'q>(query: JobQuery<'q>, job: &Job) -> JobQuery<'q> {
    query
        .bind(job.uid.clone())
        .bind(job.created)
        .bind(job.updated)
        .bind(job.job_type.clone())
        .bind(job.priority.as_i32())
        .bind(job.data.clone())
        .bind(job.result.clone())
        .bind(job.max_duration_seconds)
        .bind(job.max_retries)
        .bind(job.state.as_str())
        .bind(job.scheduled)
        .bind(job.total_executions)
        .bind(job.run_by.clone())
        .bind(job.run_deadline)
        .bind(job.run_progress)
        .bind(job.last_executed)
        .bind(job.is_recurring as i32)
        .bind(job.recurring_cron.clone())
        .bind(job.consecutive_failures)
        .bind(job.last_failure_error.clone())
        .bind(job.group_id.clone())
}

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<CreatedJob> {
        let sql = format!("{INSERT_JOB} {CREATE_CONFLICT}");
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let written = bind_job(sqlx::query_as::<_, JobRow>(&sql), job)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        let inserted = written.is_some();
        let stored = match written {
            Some(row) => row,
            None => sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE uid = ?")
                .bind(&job.uid)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?,
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(CreatedJob {
            job: stored.into_job(),
            inserted,
        })
    }

    async fn upsert_recurring(&self, job: &Job) -> Result<Job> {
        let sql = format!("{INSERT_JOB} {RECURRING_CONFLICT}");
        let row = bind_job(sqlx::query_as::<_, JobRow>(&sql), job)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.into_job())
    }

    async fn find(&self, uid: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(row.map(|r| r.into_job()))
    }

    async fn list_due(&self, now: i64, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE (state = 'scheduled' AND scheduled <= ?)
               OR (state = 'running' AND run_deadline < ?)
            ORDER BY scheduled ASC, priority DESC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(|r| r.into_job()).collect())
    }

    async fn claim(
        &self,
        uid: &str,
        run_by: &str,
        now: i64,
        run_deadline: i64,
    ) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET state = 'running',
                run_by = ?,
                run_deadline = ?,
                run_progress = 0,
                last_executed = ?,
                total_executions = total_executions + 1,
                updated = ?
            WHERE uid = ?
              AND ((state = 'scheduled' AND scheduled <= ?)
                OR (state = 'running' AND run_deadline < ?))
            RETURNING *
            "#,
        )
        .bind(run_by)
        .bind(run_deadline)
        .bind(now)
        .bind(now)
        .bind(uid)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|r| r.into_job()))
    }

    async fn update_progress(
        &self,
        uid: &str,
        run_by: &str,
        progress: i32,
        result: &str,
        now: i64,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET run_progress = ?, result = ?, updated = ?
            WHERE uid = ? AND state = 'running' AND run_by = ?
            "#,
        )
        .bind(progress)
        .bind(result)
        .bind(now)
        .bind(uid)
        .bind(run_by)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn finalize(&self, job: &Job, run_by: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET updated = ?,
                result = ?,
                state = ?,
                scheduled = ?,
                total_executions = ?,
                run_by = ?,
                run_deadline = ?,
                run_progress = ?,
                last_executed = ?,
                consecutive_failures = ?,
                last_failure_error = ?
            WHERE uid = ? AND state = 'running' AND run_by = ?
            "#,
        )
        .bind(job.updated)
        .bind(&job.result)
        .bind(job.state.as_str())
        .bind(job.scheduled)
        .bind(job.total_executions)
        .bind(&job.run_by)
        .bind(job.run_deadline)
        .bind(job.run_progress)
        .bind(job.last_executed)
        .bind(job.consecutive_failures)
        .bind(&job.last_failure_error)
        .bind(&job.uid)
        .bind(run_by)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn cancel_pending(&self, uid: &str, now: i64) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET state = 'canceled', run_by = '', updated = ?
            WHERE uid = ? AND state = 'scheduled' AND is_recurring = 0
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|r| r.into_job()))
    }

    async fn next_due(&self) -> Result<Option<i64>> {
        let next: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(CASE WHEN state = 'scheduled' THEN scheduled ELSE run_deadline END)
            FROM jobs
            WHERE state IN ('scheduled', 'running')
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(next)
    }

    async fn delete_old(&self, older_than: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE is_recurring = 0
              AND state IN ('finished', 'failed', 'canceled')
              AND updated < ?
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

// Helper struct for sqlx row mapping
#[derive(sqlx::FromRow)]
struct JobRow {
    uid: String,
    created: i64,
    updated: i64,
    job_type: String,
    priority: i32,
    data: String,
    result: String,
    max_duration_seconds: i64,
    max_retries: i32,
    state: String,
    scheduled: i64,
    total_executions: i32,
    run_by: String,
    run_deadline: i64,
    run_progress: i32,
    last_executed: i64,
    is_recurring: i32, // SQLite boolean as integer
    recurring_cron: String,
    consecutive_failures: i32,
    last_failure_error: String,
    group_id: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Job {
        let (state, known) = JobState::normalize(&self.state);
        if !known {
            warn!(uid = %self.uid, state = %self.state, "Unknown persisted job state, treating as scheduled");
        }
        let (priority, known) = Priority::normalize(self.priority);
        if !known {
            warn!(uid = %self.uid, priority = self.priority, "Unknown persisted priority, treating as normal");
        }

        Job {
            uid: self.uid,
            created: self.created,
            updated: self.updated,
            job_type: self.job_type,
            priority,
            data: self.data,
            result: self.result,
            max_duration_seconds: self.max_duration_seconds,
            max_retries: self.max_retries,
            state,
            scheduled: self.scheduled,
            total_executions: self.total_executions,
            run_by: self.run_by,
            run_deadline: self.run_deadline,
            run_progress: self.run_progress,
            last_executed: self.last_executed,
            is_recurring: self.is_recurring != 0,
            recurring_cron: self.recurring_cron,
            consecutive_failures: self.consecutive_failures,
            last_failure_error: self.last_failure_error,
            group_id: self.group_id,
        }
    }
}

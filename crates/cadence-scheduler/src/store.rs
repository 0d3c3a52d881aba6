//! Persisted job table with concurrency-safe CRUD.
//!
//! Every call locks the one `tokio::sync::Mutex` around the SQLite connection
//! for its whole read-modify-write, so an API edit (e.g. pause) can never
//! interleave with an engine-side runtime-state update (e.g. mark running)
//! into a lost update. This single lock is the only concurrency-safety
//! mechanism in the system; job counts are small and writes are infrequent
//! relative to the wakeup cadence.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use cadence_core::config::SCHEDULE_ERROR_LIMIT;

use crate::calc;
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{ExecutionRecord, Job, JobPatch, NewJob, RunCause, RunStatus, Trigger};

const JOB_COLUMNS: &str = "id, name, description, enabled, delete_after_run, trigger_def,
     payload, timeout_secs, next_run_at, running_at, last_run_at, last_status,
     last_error, last_duration_ms, consecutive_errors, schedule_error_count,
     created_at, updated_at";

/// Aggregate view for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSummary {
    pub total: u64,
    pub enabled: u64,
    pub running: u64,
    pub next_wakeup: Option<DateTime<Utc>>,
}

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Wrap a connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a job. The trigger is validated here — the store never persists
    /// an unevaluable trigger — and the initial `next_run_at` is computed.
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        let now = Utc::now();
        let next = initial_next_run(&new.trigger, new.enabled, now)?;

        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            description: new.description,
            enabled: new.enabled,
            delete_after_run: new.delete_after_run,
            trigger: new.trigger,
            payload: new.payload,
            timeout_secs: new.timeout_secs,
            next_run_at: next,
            running_at: None,
            last_run_at: None,
            last_status: RunStatus::Unset,
            last_error: None,
            last_duration_ms: None,
            consecutive_errors: 0,
            schedule_error_count: 0,
            created_at: now,
            updated_at: now,
        };

        let trigger_json = serde_json::to_string(&job.trigger)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO jobs
             (id, name, description, enabled, delete_after_run, trigger_def,
              payload, timeout_secs, next_run_at, running_at, last_run_at,
              last_status, last_error, last_duration_ms, consecutive_errors,
              schedule_error_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,NULL,NULL,'unset',NULL,NULL,0,0,?10,?10)",
            rusqlite::params![
                job.id,
                job.name,
                job.description,
                job.enabled,
                job.delete_after_run,
                trigger_json,
                job.payload,
                job.timeout_secs as i64,
                job.next_run_at.map(ts),
                ts(now),
            ],
        )?;
        info!(job_id = %job.id, name = %job.name, "job created");
        Ok(job)
    }

    /// Load a job by ID.
    pub async fn get(&self, id: &str) -> Result<Job> {
        let conn = self.conn.lock().await;
        get_locked(&conn, id)
    }

    /// Return all jobs ordered by creation time.
    pub async fn list(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at"))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Apply a partial update. A trigger change (or a re-enable) recomputes
    /// `next_run_at` and clears the schedule-error counter; runtime-state
    /// fields are never touched from here.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let now = Utc::now();
        let conn = self.conn.lock().await;
        let mut job = get_locked(&conn, id)?;

        let was_enabled = job.enabled;
        let trigger_changed = patch
            .trigger
            .as_ref()
            .is_some_and(|t| *t != job.trigger);

        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(description) = patch.description {
            job.description = description;
        }
        if let Some(trigger) = patch.trigger {
            job.trigger = trigger;
        }
        if let Some(payload) = patch.payload {
            job.payload = payload;
        }
        if let Some(timeout_secs) = patch.timeout_secs {
            job.timeout_secs = timeout_secs;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        if let Some(delete_after_run) = patch.delete_after_run {
            job.delete_after_run = delete_after_run;
        }

        if trigger_changed || (job.enabled && !was_enabled) {
            job.next_run_at = initial_next_run(&job.trigger, job.enabled, now)?;
            job.schedule_error_count = 0;
        }
        job.updated_at = now;

        let trigger_json = serde_json::to_string(&job.trigger)?;
        conn.execute(
            "UPDATE jobs SET name=?1, description=?2, enabled=?3, delete_after_run=?4,
                trigger_def=?5, payload=?6, timeout_secs=?7, next_run_at=?8,
                schedule_error_count=?9, updated_at=?10
             WHERE id=?11",
            rusqlite::params![
                job.name,
                job.description,
                job.enabled,
                job.delete_after_run,
                trigger_json,
                job.payload,
                job.timeout_secs as i64,
                job.next_run_at.map(ts),
                job.schedule_error_count,
                ts(now),
                id,
            ],
        )?;
        info!(job_id = %id, "job updated");
        Ok(job)
    }

    /// Delete a job and its run history.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        conn.execute("DELETE FROM job_runs WHERE job_id = ?1", [id])?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Enabled, not-running jobs whose `next_run_at` has arrived, earliest
    /// first — the dispatch order within a tick.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE enabled = 1 AND running_at IS NULL
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at"
        ))?;
        let jobs = stmt
            .query_map([ts(now)], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Atomically set the in-flight marker iff it is clear. Exactly one of
    /// two racing dispatch attempts observes `true`; the loser gets `false`.
    pub async fn try_claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET running_at = ?1, updated_at = ?1
             WHERE id = ?2 AND running_at IS NULL",
            rusqlite::params![ts(now), id],
        )?;
        if n == 1 {
            return Ok(true);
        }
        // Distinguish "already running" from "no such job".
        get_locked(&conn, id)?;
        Ok(false)
    }

    /// Record a successful execution: clear the marker, reset the error
    /// counter, store the outcome and the freshly computed `next_run_at`.
    pub async fn succeed(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        duration_ms: i64,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET running_at = NULL, last_run_at = ?1, last_status = 'ok',
                last_error = NULL, last_duration_ms = ?2, consecutive_errors = 0,
                next_run_at = ?3, updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![ts(started_at), duration_ms, next_run.map(ts), ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record a failed execution. Increments `consecutive_errors` under the
    /// lock and derives the retry slot from the new count via `backoff`, so a
    /// concurrent edit cannot observe a half-applied failure. Returns the new
    /// count and the scheduled retry time.
    pub async fn fail<F>(
        &self,
        id: &str,
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        error: &str,
        backoff: F,
    ) -> Result<(u32, DateTime<Utc>)>
    where
        F: FnOnce(u32) -> Duration,
    {
        let conn = self.conn.lock().await;
        let job = get_locked(&conn, id)?;
        let errors = job.consecutive_errors + 1;
        let retry_at = finished_at + backoff(errors);
        conn.execute(
            "UPDATE jobs SET running_at = NULL, last_run_at = ?1, last_status = 'error',
                last_error = ?2, last_duration_ms = ?3, consecutive_errors = ?4,
                next_run_at = ?5, updated_at = ?6
             WHERE id = ?7",
            rusqlite::params![
                ts(finished_at),
                error,
                duration_ms,
                errors,
                ts(retry_at),
                ts(Utc::now()),
                id
            ],
        )?;
        Ok((errors, retry_at))
    }

    /// Record a successful one-shot run: outcome stored, job disabled in
    /// place with no further schedule.
    pub async fn succeed_one_shot(
        &self,
        id: &str,
        started_at: DateTime<Utc>,
        duration_ms: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET running_at = NULL, last_run_at = ?1, last_status = 'ok',
                last_error = NULL, last_duration_ms = ?2, consecutive_errors = 0,
                next_run_at = NULL, enabled = 0, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![ts(started_at), duration_ms, ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Remove a completed `delete_after_run` job. Unlike [`delete`], the run
    /// history is kept — the log is append-only and outlives the job.
    ///
    /// [`delete`]: JobStore::delete
    pub async fn remove_after_run(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "one-shot job removed after run");
        Ok(())
    }

    /// Recover a job whose in-flight marker was never released (crash or
    /// stall): clear it, record the error, feed the job back into normal
    /// scheduling. `disable` is set when the trigger is exhausted (a crashed
    /// one-shot whose instant has passed).
    pub async fn recover_abandoned(
        &self,
        id: &str,
        error: &str,
        next_run: Option<DateTime<Utc>>,
        disable: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET running_at = NULL, last_status = 'error', last_error = ?1,
                consecutive_errors = consecutive_errors + 1,
                next_run_at = ?2, enabled = CASE WHEN ?3 THEN 0 ELSE enabled END,
                updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![error, next_run.map(ts), disable, ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Jobs whose in-flight marker is older than `cutoff` — crashed holders.
    pub async fn abandoned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE running_at IS NOT NULL AND running_at < ?1"
        ))?;
        let jobs = stmt
            .query_map([ts(cutoff)], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Enabled jobs with no `next_run_at` that are still worth recomputing.
    pub async fn jobs_needing_schedule(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE enabled = 1 AND running_at IS NULL AND next_run_at IS NULL
               AND schedule_error_count < ?1"
        ))?;
        let jobs = stmt
            .query_map([SCHEDULE_ERROR_LIMIT], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub async fn set_next_run(&self, id: &str, next_run: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![ts(next_run), ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Count a schedule-computation failure. At `SCHEDULE_ERROR_LIMIT` the
    /// job is force-disabled but kept, so its last error stays visible.
    /// Returns the new count.
    pub async fn bump_schedule_error(&self, id: &str, error: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        let job = get_locked(&conn, id)?;
        let count = job.schedule_error_count + 1;
        let disable = count >= SCHEDULE_ERROR_LIMIT;
        conn.execute(
            "UPDATE jobs SET schedule_error_count = ?1, last_error = ?2,
                enabled = CASE WHEN ?3 THEN 0 ELSE enabled END,
                next_run_at = CASE WHEN ?3 THEN NULL ELSE next_run_at END,
                updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![count, error, disable, ts(Utc::now()), id],
        )?;
        if disable {
            tracing::warn!(job_id = %id, count, "schedule broken — job disabled");
        }
        Ok(count)
    }

    /// Mark a missed one-shot as skipped instead of catching it up; the job
    /// is disabled in place so the record stays visible.
    pub async fn mark_skipped(&self, id: &str, reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET last_status = 'skipped', last_error = ?1,
                next_run_at = NULL, enabled = 0, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![reason, ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Retry support: zero both error counters and reschedule immediately.
    pub async fn reset_errors(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE jobs SET consecutive_errors = 0, schedule_error_count = 0,
                last_error = NULL, next_run_at = ?1, enabled = 1, updated_at = ?1
             WHERE id = ?2",
            rusqlite::params![ts(now), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "error counters reset, rescheduled immediately");
        get_locked(&conn, id)
    }

    /// Append one execution record. The history is append-only.
    pub async fn append_run(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO job_runs (job_id, started_at, finished_at, duration_ms, status, error, cause)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                record.job_id,
                ts(record.started_at),
                ts(record.finished_at),
                record.duration_ms,
                record.status.to_string(),
                record.error,
                record.cause.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most-recent runs for a job, newest first.
    pub async fn list_runs(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT job_id, started_at, finished_at, duration_ms, status, error, cause
             FROM job_runs WHERE job_id = ?1
             ORDER BY started_at DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(rusqlite::params![job_id, limit as i64], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Aggregate counts plus the earliest pending `next_run_at`.
    pub async fn status_summary(&self) -> Result<StatusSummary> {
        let conn = self.conn.lock().await;
        let (total, enabled, running): (u64, u64, u64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(enabled), 0),
                    COALESCE(SUM(running_at IS NOT NULL), 0)
             FROM jobs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let next_wakeup = next_wakeup_locked(&conn)?;
        Ok(StatusSummary {
            total,
            enabled,
            running,
            next_wakeup,
        })
    }

    /// Earliest `next_run_at` among enabled, idle jobs — what the timer
    /// sleeps towards. Running jobs are excluded: their stale `next_run_at`
    /// must not pin the loop awake.
    pub async fn next_wakeup(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        next_wakeup_locked(&conn)
    }
}

fn get_locked(conn: &Connection, id: &str) -> Result<Job> {
    match conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        row_to_job,
    ) {
        Ok(job) => Ok(job),
        Err(rusqlite::Error::QueryReturnedNoRows) => Err(SchedulerError::JobNotFound {
            id: id.to_string(),
        }),
        Err(e) => Err(SchedulerError::Database(e)),
    }
}

fn next_wakeup_locked(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let min: Option<String> = conn.query_row(
        "SELECT MIN(next_run_at) FROM jobs
         WHERE enabled = 1 AND running_at IS NULL AND next_run_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(min.and_then(|s| parse_ts(&s)))
}

/// Initial `next_run_at` for a freshly validated trigger. An `At` instant
/// that has already elapsed is rejected at the API boundary rather than
/// silently creating an enabled job with no schedule.
fn initial_next_run(
    trigger: &Trigger,
    enabled: bool,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let next = calc::next_run(trigger, now)?;
    if !enabled {
        return Ok(next);
    }
    match next {
        Some(at) => Ok(Some(at)),
        None => Err(SchedulerError::Schedule(
            "scheduled time is already in the past".to_string(),
        )),
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn bad_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

/// Map a SQLite row (in `JOB_COLUMNS` order) to a `Job`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let trigger_json: String = row.get(5)?;
    let trigger: Trigger = serde_json::from_str(&trigger_json)
        .map_err(|e| bad_column(5, format!("bad trigger JSON: {e}")))?;
    let status_str: String = row.get(11)?;
    let last_status: RunStatus = status_str
        .parse()
        .map_err(|e: String| bad_column(11, e))?;

    let opt_ts = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = row.get(idx)?;
        Ok(raw.as_deref().and_then(parse_ts))
    };
    let req_ts = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        let raw: String = row.get(idx)?;
        parse_ts(&raw).ok_or_else(|| bad_column(idx, format!("bad timestamp: {raw}")))
    };

    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        enabled: row.get(3)?,
        delete_after_run: row.get(4)?,
        trigger,
        payload: row.get(6)?,
        timeout_secs: row.get::<_, i64>(7)? as u64,
        next_run_at: opt_ts(8)?,
        running_at: opt_ts(9)?,
        last_run_at: opt_ts(10)?,
        last_status,
        last_error: row.get(12)?,
        last_duration_ms: row.get(13)?,
        consecutive_errors: row.get::<_, i64>(14)? as u32,
        schedule_error_count: row.get::<_, i64>(15)? as u32,
        created_at: req_ts(16)?,
        updated_at: req_ts(17)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status_str: String = row.get(4)?;
    let cause_str: String = row.get(6)?;
    let started_raw: String = row.get(1)?;
    let finished_raw: String = row.get(2)?;
    Ok(ExecutionRecord {
        job_id: row.get(0)?,
        started_at: parse_ts(&started_raw)
            .ok_or_else(|| bad_column(1, format!("bad timestamp: {started_raw}")))?,
        finished_at: parse_ts(&finished_raw)
            .ok_or_else(|| bad_column(2, format!("bad timestamp: {finished_raw}")))?,
        duration_ms: row.get(3)?,
        status: status_str.parse().map_err(|e: String| bad_column(4, e))?,
        error: row.get(5)?,
        cause: cause_str.parse().map_err(|e: String| bad_column(6, e))?,
    })
}

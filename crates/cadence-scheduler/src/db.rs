use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table and the append-only `job_runs` history table
/// (idempotent), plus an index on `next_run_at` so the due-job poll stays
/// efficient with many scheduled jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                   TEXT    NOT NULL PRIMARY KEY,
            name                 TEXT    NOT NULL,
            description          TEXT    NOT NULL DEFAULT '',
            enabled              INTEGER NOT NULL DEFAULT 1,
            delete_after_run     INTEGER NOT NULL DEFAULT 0,
            trigger_def          TEXT    NOT NULL,   -- JSON-encoded Trigger enum
            payload              TEXT    NOT NULL DEFAULT '',  -- opaque callback payload
            timeout_secs         INTEGER NOT NULL,
            next_run_at          TEXT,               -- ISO-8601 or NULL
            running_at           TEXT,               -- in-flight marker, ISO-8601 or NULL
            last_run_at          TEXT,
            last_status          TEXT    NOT NULL DEFAULT 'unset',
            last_error           TEXT,
            last_duration_ms     INTEGER,
            consecutive_errors   INTEGER NOT NULL DEFAULT 0,
            schedule_error_count INTEGER NOT NULL DEFAULT 0,
            created_at           TEXT    NOT NULL,
            updated_at           TEXT    NOT NULL
        ) STRICT;

        -- Efficient due scan: SELECT … WHERE next_run_at <= ? ORDER BY next_run_at
        CREATE INDEX IF NOT EXISTS idx_jobs_next_run_at ON jobs (next_run_at);

        CREATE TABLE IF NOT EXISTS job_runs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id      TEXT    NOT NULL,
            started_at  TEXT    NOT NULL,
            finished_at TEXT    NOT NULL,
            duration_ms INTEGER NOT NULL,
            status      TEXT    NOT NULL,
            error       TEXT,
            cause       TEXT    NOT NULL    -- 'schedule' or 'manual'
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_runs_job_id ON job_runs (job_id, started_at);
        ",
    )?;
    Ok(())
}

use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The trigger definition cannot be evaluated (malformed cron expression,
    /// unknown timezone, zero interval). Counted per-job via
    /// `schedule_error_count`; never crashes the loop.
    #[error("schedule computation failed: {0}")]
    Schedule(String),

    /// Underlying SQLite / rusqlite error. Surfaces to the caller unchanged.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No job with the given ID exists in the store.
    #[error("job not found: {id}")]
    JobNotFound { id: String },

    /// The job's in-flight marker is already set — a second dispatch attempt
    /// (e.g. run-now racing the schedule) was rejected.
    #[error("job already running: {id}")]
    AlreadyRunning { id: String },

    /// A stored trigger or run record failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when a job is due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Standard 5-field cron expression evaluated in `timezone` (IANA name,
    /// `None` → UTC).
    Cron {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },

    /// Run exactly once at the given UTC instant.
    At { at: DateTime<Utc> },

    /// Run every `every_secs` seconds on the grid `anchor + k·every_secs`.
    /// The anchor keeps the cadence phase-stable across missed wakeups.
    Every {
        every_secs: u64,
        anchor: DateTime<Utc>,
    },
}

impl Trigger {
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::At { .. })
    }
}

/// Outcome of the most recent execution, persisted on the job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Last execution completed successfully.
    Ok,
    /// Last execution failed or timed out.
    Error,
    /// The scheduled window was missed and deliberately not caught up.
    Skipped,
    /// Never executed.
    Unset,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
            RunStatus::Unset => "unset",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(RunStatus::Ok),
            "error" => Ok(RunStatus::Error),
            "skipped" => Ok(RunStatus::Skipped),
            "unset" => Ok(RunStatus::Unset),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// What caused a dispatch: the regular schedule or a manual run-now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCause {
    Schedule,
    Manual,
}

impl std::fmt::Display for RunCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunCause::Schedule => write!(f, "schedule"),
            RunCause::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for RunCause {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(RunCause::Schedule),
            "manual" => Ok(RunCause::Manual),
            other => Err(format!("unknown run cause: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4 string — primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Whether the scheduler should fire this job.
    pub enabled: bool,
    /// Remove the job after its first successful run (one-shot jobs).
    pub delete_after_run: bool,
    /// When the job is due.
    pub trigger: Trigger,
    /// Opaque payload handed to the execution callback unopened.
    pub payload: String,
    /// Execution bound for a single run.
    pub timeout_secs: u64,
    /// Next planned execution, if any.
    pub next_run_at: Option<DateTime<Utc>>,
    /// In-flight marker — set only while dispatched.
    pub running_at: Option<DateTime<Utc>>,
    /// Start of the most recent execution.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent execution.
    pub last_status: RunStatus,
    /// Error text when `last_status == Error`.
    pub last_error: Option<String>,
    /// Wall-clock duration of the most recent execution.
    pub last_duration_ms: Option<i64>,
    /// Execution failures since the last success.
    pub consecutive_errors: u32,
    /// Schedule recomputation failures — separate from execution failures.
    pub schedule_error_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a job. The store assigns id and timestamps and
/// computes the initial `next_run_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: Trigger,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
}

fn default_timeout_secs() -> u64 {
    cadence_core::config::DEFAULT_TIMEOUT_SECS
}

fn bool_true() -> bool {
    true
}

/// Partial update applied by the management surface. `None` fields are left
/// untouched; runtime-state fields are never patchable from the outside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger: Option<Trigger>,
    pub payload: Option<String>,
    pub timeout_secs: Option<u64>,
    pub enabled: Option<bool>,
    pub delete_after_run: Option<bool>,
}

/// Append-only history entry for one dispatch. Written by the Executor,
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub error: Option<String>,
    pub cause: RunCause,
}

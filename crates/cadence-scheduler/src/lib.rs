//! `cadence-scheduler` — self-driven job scheduling and execution engine with
//! SQLite persistence.
//!
//! # Overview
//!
//! Jobs are persisted to a SQLite `jobs` table behind the [`store::JobStore`]
//! serialization lock. The [`engine::SchedulerEngine`] sleeps exactly until
//! the nearest `next_run_at` (capped at 60 s), wakes, recovers stalled
//! executions, and dispatches due jobs to the [`executor::Executor`] under a
//! concurrency bound. Failed runs retry on a fixed backoff ladder; crashed
//! runs are detected by their leftover in-flight marker and fed back into
//! normal scheduling.
//!
//! # Trigger variants
//!
//! | Variant | Behaviour                                                  |
//! |---------|------------------------------------------------------------|
//! | `Cron`  | 5-field cron expression in a job-local timezone            |
//! | `At`    | Single fire at an absolute UTC instant                     |
//! | `Every` | Fixed interval on an anchored grid (no drift across sleeps)|

pub mod calc;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod runner;
pub mod store;
pub mod timer;
pub mod types;

pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use executor::Executor;
pub use runner::JobRunner;
pub use store::{JobStore, StatusSummary};
pub use types::{ExecutionRecord, Job, JobPatch, NewJob, RunCause, RunStatus, Trigger};

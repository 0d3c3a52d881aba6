//! Runs one due job: claim → callback under timeout → outcome + backoff.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::calc;
use crate::error::{Result, SchedulerError};
use crate::runner::JobRunner;
use crate::store::JobStore;
use crate::types::{ExecutionRecord, Job, RunCause, RunStatus, Trigger};

/// Fixed retry ladder indexed by `consecutive_errors`, capping at the last
/// rung for any further failure.
const BACKOFF_LADDER_SECS: [i64; 5] = [30, 60, 300, 900, 3600];

/// Retry delay after the `consecutive_errors`-th consecutive failure.
pub fn backoff_delay(consecutive_errors: u32) -> Duration {
    let idx = (consecutive_errors.max(1) as usize - 1).min(BACKOFF_LADDER_SECS.len() - 1);
    Duration::seconds(BACKOFF_LADDER_SECS[idx])
}

pub struct Executor {
    store: Arc<JobStore>,
    runner: Arc<dyn JobRunner>,
}

impl Executor {
    pub fn new(store: Arc<JobStore>, runner: Arc<dyn JobRunner>) -> Self {
        Self { store, runner }
    }

    /// Execute `job` once. Claims the in-flight marker first; a job that is
    /// already running is rejected with `AlreadyRunning` — this is what makes
    /// a run-now racing the schedule (or two overlapping ticks) safe.
    ///
    /// The outcome is persisted on the job row and appended to the run
    /// history before returning.
    pub async fn run(&self, job: &Job, cause: RunCause) -> Result<ExecutionRecord> {
        let started_at = Utc::now();
        if !self.store.try_claim(&job.id, started_at).await? {
            return Err(SchedulerError::AlreadyRunning {
                id: job.id.clone(),
            });
        }

        debug!(job_id = %job.id, name = %job.name, %cause, "executing job");
        let timeout = std::time::Duration::from_secs(job.timeout_secs);
        let outcome = tokio::time::timeout(timeout, self.runner.run(&job.payload)).await;

        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds();

        let record = match outcome {
            Ok(Ok(())) => {
                self.apply_success(job, started_at, duration_ms).await?;
                info!(job_id = %job.id, duration_ms, "job succeeded");
                ExecutionRecord {
                    job_id: job.id.clone(),
                    started_at,
                    finished_at,
                    duration_ms,
                    status: RunStatus::Ok,
                    error: None,
                    cause,
                }
            }
            Ok(Err(message)) => {
                self.apply_failure(job, finished_at, duration_ms, &message)
                    .await?;
                ExecutionRecord {
                    job_id: job.id.clone(),
                    started_at,
                    finished_at,
                    duration_ms,
                    status: RunStatus::Error,
                    error: Some(message),
                    cause,
                }
            }
            // The hung callback is abandoned at the timeout boundary; the
            // marker is cleared as a failure, never left stale.
            Err(_) => {
                let message = format!("execution timed out after {}s", job.timeout_secs);
                self.apply_failure(job, finished_at, duration_ms, &message)
                    .await?;
                ExecutionRecord {
                    job_id: job.id.clone(),
                    started_at,
                    finished_at,
                    duration_ms,
                    status: RunStatus::Error,
                    error: Some(message),
                    cause,
                }
            }
        };

        self.store.append_run(&record).await?;
        Ok(record)
    }

    /// Success: reset the error counter and recompute `next_run_at` fresh —
    /// the regular cadence resumes here even after a run of backoff retries.
    /// One-shot jobs are deleted (`delete_after_run`) or disabled instead.
    async fn apply_success(&self, job: &Job, started_at: chrono::DateTime<Utc>, duration_ms: i64) -> Result<()> {
        if job.trigger.is_one_shot() {
            if job.delete_after_run {
                // Record the run first (append_run happens after, keyed by
                // job id), then drop the job row; history is kept.
                self.store.remove_after_run(&job.id).await?;
            } else {
                self.store
                    .succeed_one_shot(&job.id, started_at, duration_ms)
                    .await?;
            }
            return Ok(());
        }

        let next_run = match calc::next_run(&job.trigger, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                // Counted separately from execution failures; the engine's
                // recompute pass drives the three-strike disable.
                warn!(job_id = %job.id, error = %e, "next-run recompute failed after success");
                self.store
                    .bump_schedule_error(&job.id, &e.to_string())
                    .await?;
                None
            }
        };
        self.store
            .succeed(&job.id, started_at, duration_ms, next_run)
            .await
    }

    /// Failure or timeout: the backoff ladder overrides the calculator for
    /// this one cycle; `consecutive_errors` is incremented under the store
    /// lock so the delay always matches the persisted count.
    async fn apply_failure(
        &self,
        job: &Job,
        finished_at: chrono::DateTime<Utc>,
        duration_ms: i64,
        message: &str,
    ) -> Result<()> {
        let (errors, retry_at) = self
            .store
            .fail(&job.id, finished_at, duration_ms, message, backoff_delay)
            .await?;
        warn!(
            job_id = %job.id,
            consecutive_errors = errors,
            retry_at = %retry_at,
            error = %message,
            "job failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobPatch, NewJob};
    use chrono::{DateTime, TimeZone};
    use rusqlite::Connection;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Runner that pops one scripted result per invocation.
    struct ScriptedRunner {
        script: Mutex<VecDeque<std::result::Result<(), String>>>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<std::result::Result<(), String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, _payload: &str) -> std::result::Result<(), String> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    /// Runner that never completes — exercises the timeout boundary.
    struct HungRunner;

    #[async_trait::async_trait]
    impl JobRunner for HungRunner {
        async fn run(&self, _payload: &str) -> std::result::Result<(), String> {
            tokio::time::sleep(std::time::Duration::from_secs(86_400)).await;
            Ok(())
        }
    }

    fn harness(runner: Arc<dyn JobRunner>) -> (Arc<JobStore>, Executor) {
        let store = Arc::new(JobStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let executor = Executor::new(Arc::clone(&store), runner);
        (store, executor)
    }

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn every_job() -> NewJob {
        NewJob {
            name: "tick".to_string(),
            description: String::new(),
            trigger: Trigger::Every {
                every_secs: 600,
                anchor: anchor(),
            },
            payload: "{}".to_string(),
            timeout_secs: 5,
            enabled: true,
            delete_after_run: false,
        }
    }

    #[test]
    fn ladder_matches_spec_and_caps() {
        let expected = [30, 60, 300, 900, 3600, 3600, 3600];
        for (n, secs) in expected.iter().enumerate() {
            assert_eq!(backoff_delay(n as u32 + 1), Duration::seconds(*secs));
        }
    }

    #[tokio::test]
    async fn success_records_run_and_reschedules() {
        let (store, executor) = harness(ScriptedRunner::new(vec![Ok(())]));
        let job = store.create(every_job()).await.unwrap();

        let record = executor.run(&job, RunCause::Schedule).await.unwrap();
        assert_eq!(record.status, RunStatus::Ok);
        assert_eq!(record.cause, RunCause::Schedule);

        let loaded = store.get(&job.id).await.unwrap();
        assert_eq!(loaded.last_status, RunStatus::Ok);
        assert!(loaded.running_at.is_none());
        assert!(loaded.next_run_at.unwrap() > Utc::now());
        // On the anchor grid, not now + interval.
        let offset = (loaded.next_run_at.unwrap() - anchor()).num_seconds();
        assert_eq!(offset % 600, 0);

        let runs = store.list_runs(&job.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn consecutive_failures_walk_the_ladder() {
        let (store, executor) = harness(ScriptedRunner::new(vec![
            Err("boom 1".to_string()),
            Err("boom 2".to_string()),
            Err("boom 3".to_string()),
        ]));
        let job = store.create(every_job()).await.unwrap();

        for (n, delay_secs) in [(1u32, 30i64), (2, 60), (3, 300)] {
            let before = Utc::now();
            let record = executor.run(&job, RunCause::Schedule).await.unwrap();
            assert_eq!(record.status, RunStatus::Error);

            let loaded = store.get(&job.id).await.unwrap();
            assert_eq!(loaded.consecutive_errors, n);
            assert_eq!(loaded.last_status, RunStatus::Error);
            let delta = (loaded.next_run_at.unwrap() - before).num_seconds();
            // Allow a little slack for the wall clock between before/after.
            assert!((delay_secs - 2..=delay_secs + 2).contains(&delta));
        }
    }

    #[tokio::test]
    async fn one_success_resets_the_counter() {
        let (store, executor) = harness(ScriptedRunner::new(vec![
            Err("a".to_string()),
            Err("b".to_string()),
            Ok(()),
        ]));
        let job = store.create(every_job()).await.unwrap();

        executor.run(&job, RunCause::Schedule).await.unwrap();
        executor.run(&job, RunCause::Schedule).await.unwrap();
        assert_eq!(store.get(&job.id).await.unwrap().consecutive_errors, 2);

        executor.run(&job, RunCause::Schedule).await.unwrap();
        let loaded = store.get(&job.id).await.unwrap();
        assert_eq!(loaded.consecutive_errors, 0);
        assert!(loaded.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_failure_with_cleared_marker() {
        let (store, executor) = harness(Arc::new(HungRunner));
        let job = store.create(every_job()).await.unwrap();

        let record = executor.run(&job, RunCause::Schedule).await.unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert!(record.error.as_deref().unwrap().contains("timed out"));

        let loaded = store.get(&job.id).await.unwrap();
        assert!(loaded.running_at.is_none());
        assert_eq!(loaded.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn overlapping_dispatch_is_rejected() {
        let (store, executor) = harness(ScriptedRunner::new(vec![Ok(())]));
        let job = store.create(every_job()).await.unwrap();

        store.try_claim(&job.id, Utc::now()).await.unwrap();
        let err = executor.run(&job, RunCause::Manual).await.unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyRunning { .. }));

        // Nothing was recorded for the rejected attempt.
        assert!(store.list_runs(&job.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_shot_with_delete_after_run_vanishes_from_list() {
        let (store, executor) = harness(ScriptedRunner::new(vec![Ok(())]));
        let job = store
            .create(NewJob {
                trigger: Trigger::At {
                    at: Utc::now() + Duration::seconds(10),
                },
                delete_after_run: true,
                ..every_job()
            })
            .await
            .unwrap();

        executor.run(&job, RunCause::Schedule).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        // History outlives the job.
        assert_eq!(store.list_runs(&job.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_shot_without_delete_is_disabled_after_success() {
        let (store, executor) = harness(ScriptedRunner::new(vec![Ok(())]));
        let job = store
            .create(NewJob {
                trigger: Trigger::At {
                    at: Utc::now() + Duration::seconds(10),
                },
                ..every_job()
            })
            .await
            .unwrap();

        executor.run(&job, RunCause::Schedule).await.unwrap();
        let loaded = store.get(&job.id).await.unwrap();
        assert!(!loaded.enabled);
        assert!(loaded.next_run_at.is_none());
        assert_eq!(loaded.last_status, RunStatus::Ok);
    }

    #[tokio::test]
    async fn failed_one_shot_retries_on_the_ladder() {
        let (store, executor) = harness(ScriptedRunner::new(vec![Err("flaky".to_string())]));
        let job = store
            .create(NewJob {
                trigger: Trigger::At {
                    at: Utc::now() + Duration::seconds(10),
                },
                delete_after_run: true,
                ..every_job()
            })
            .await
            .unwrap();

        executor.run(&job, RunCause::Schedule).await.unwrap();
        let loaded = store.get(&job.id).await.unwrap();
        assert_eq!(loaded.consecutive_errors, 1);
        assert!(loaded.next_run_at.is_some());
        assert!(loaded.enabled);
    }

    #[tokio::test]
    async fn manual_run_recomputes_the_regular_slot() {
        let (store, executor) = harness(ScriptedRunner::new(vec![Ok(())]));
        // Daily at 09:00 — next_run_at is somewhere in the next 24h.
        let job = store
            .create(NewJob {
                trigger: Trigger::Cron {
                    expression: "0 9 * * *".to_string(),
                    timezone: None,
                },
                ..every_job()
            })
            .await
            .unwrap();
        let scheduled_slot = job.next_run_at.unwrap();

        let record = executor.run(&job, RunCause::Manual).await.unwrap();
        assert_eq!(record.cause, RunCause::Manual);

        // The regular cadence is undisturbed: recomputing from now lands on
        // the same slot the schedule already held.
        let loaded = store.get(&job.id).await.unwrap();
        assert_eq!(loaded.next_run_at.unwrap(), scheduled_slot);
    }
}

//! The control loop: startup recovery, stall sweep, due scan, bounded
//! fire-and-continue dispatch, capped sleep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use cadence_core::config::STARTUP_GRACE_SECS;

use crate::calc;
use crate::error::{Result, SchedulerError};
use crate::executor::Executor;
use crate::store::JobStore;
use crate::timer;
use crate::types::{Job, RunCause, Trigger};

pub struct SchedulerEngine {
    store: Arc<JobStore>,
    executor: Arc<Executor>,
    /// Bounds concurrently in-flight executions across ticks.
    permits: Arc<Semaphore>,
}

impl SchedulerEngine {
    pub fn new(store: Arc<JobStore>, executor: Arc<Executor>, max_concurrent: usize) -> Self {
        Self {
            store,
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Main loop. Runs startup recovery once, then ticks until `shutdown`
    /// broadcasts `true`. Store failures are logged and retried on the next
    /// tick — only process shutdown ends the loop.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        if let Err(e) = self.startup_recovery().await {
            error!("startup recovery failed: {e}");
        }

        loop {
            if let Err(e) = self.tick().await {
                error!("scheduler tick failed: {e}");
            }

            let sleep = match self.store.next_wakeup().await {
                Ok(next) => timer::sleep_duration(next, Utc::now()),
                Err(e) => {
                    error!("next-wakeup query failed: {e}");
                    std::time::Duration::from_secs(1)
                }
            };
            debug!(sleep_secs = sleep.as_secs(), "sleeping until next wakeup");

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // In-flight markers are left for the next startup
                        // recovery to clean up.
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One-time pass before the first tick.
    ///
    /// Every `running_at` marker found here proves the previous process died
    /// mid-execution — recovered exactly like a stalled job. Enabled jobs
    /// whose slot passed while the process was down stay due and are caught
    /// up on the first tick, except one-shots older than the grace window,
    /// which are marked skipped instead of fired hours late.
    pub async fn startup_recovery(&self) -> Result<()> {
        let now = Utc::now();

        for job in self.store.abandoned_jobs(now).await? {
            warn!(job_id = %job.id, "clearing execution left over from previous process");
            self.recover(&job).await?;
        }

        let grace = Duration::seconds(STARTUP_GRACE_SECS);
        for job in self.store.list().await? {
            let missed_one_shot = job.enabled
                && job.trigger.is_one_shot()
                && job.next_run_at.is_some_and(|at| now - at > grace);
            if missed_one_shot {
                warn!(job_id = %job.id, name = %job.name, "one-shot missed while process was down — skipping");
                self.store
                    .mark_skipped(&job.id, "scheduled time missed while process was down")
                    .await?;
            }
        }
        Ok(())
    }

    /// One wakeup: stall sweep, schedule recompute, due scan + dispatch.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();

        // Stall detection runs before dispatch on every wake: a marker older
        // than the threshold means whoever held it died.
        for job in self.store.abandoned_jobs(timer::stall_cutoff(now)).await? {
            warn!(job_id = %job.id, running_at = ?job.running_at, "stale execution cleared");
            self.recover(&job).await?;
        }

        // Enabled jobs missing a next_run_at (e.g. the trigger broke after a
        // run) get a recompute attempt; failures count toward the
        // three-strike disable.
        for job in self.store.jobs_needing_schedule().await? {
            match calc::next_run(&job.trigger, now) {
                Ok(Some(next)) => self.store.set_next_run(&job.id, next).await?,
                Ok(None) => {
                    self.store
                        .mark_skipped(&job.id, "schedule exhausted")
                        .await?
                }
                Err(e) => {
                    self.store
                        .bump_schedule_error(&job.id, &e.to_string())
                        .await?;
                }
            }
        }

        // Dispatch earliest-due first, fire-and-continue: the loop never
        // waits for a spawned execution, and the semaphore bounds how many
        // are in flight. When permits run out the remaining jobs are still
        // due on the next tick.
        for job in self.store.due_jobs(now).await? {
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("concurrency limit reached — remaining due jobs wait for the next tick");
                    break;
                }
            };
            let executor = Arc::clone(&self.executor);
            tokio::spawn(async move {
                let _permit = permit;
                match executor.run(&job, RunCause::Schedule).await {
                    Ok(record) => {
                        debug!(job_id = %record.job_id, status = %record.status, "dispatch finished")
                    }
                    // Lost the claim race to a concurrent run-now — fine.
                    Err(SchedulerError::AlreadyRunning { id }) => {
                        debug!(job_id = %id, "already running — dispatch dropped")
                    }
                    Err(e) => error!(job_id = %job.id, "dispatch failed: {e}"),
                }
            });
        }

        Ok(())
    }

    /// Shared recovery for crashed and stalled executions: clear the marker,
    /// record the error, recompute the schedule. A one-shot whose instant has
    /// passed is disabled; a trigger that no longer evaluates feeds the
    /// schedule-error counter instead.
    async fn recover(&self, job: &Job) -> Result<()> {
        let now = Utc::now();
        match calc::next_run(&job.trigger, now) {
            Ok(Some(next)) => {
                self.store
                    .recover_abandoned(&job.id, "stale execution cleared", Some(next), false)
                    .await
            }
            Ok(None) => {
                debug_assert!(matches!(job.trigger, Trigger::At { .. }));
                self.store
                    .recover_abandoned(&job.id, "stale execution cleared", None, true)
                    .await
            }
            Err(e) => {
                self.store
                    .recover_abandoned(&job.id, "stale execution cleared", None, false)
                    .await?;
                self.store
                    .bump_schedule_error(&job.id, &e.to_string())
                    .await?;
                Ok(())
            }
        }
    }
}

// End-to-end behavior of the scheduling engine through its public API:
// claim exclusivity under a simulated race, manual dispatch, retry
// rescheduling, and clean loop shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use rusqlite::Connection;

use cadence_scheduler::{
    Executor, Job, JobRunner, JobStore, NewJob, RunCause, RunStatus, SchedulerEngine,
    SchedulerError, Trigger,
};

struct CountingRunner {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingRunner {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }
}

#[async_trait::async_trait]
impl JobRunner for CountingRunner {
    async fn run(&self, _payload: &str) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err("callback reported an error".to_string())
        } else {
            Ok(())
        }
    }
}

fn harness(runner: Arc<CountingRunner>) -> (Arc<JobStore>, Arc<Executor>, Arc<SchedulerEngine>) {
    let store = Arc::new(JobStore::new(Connection::open_in_memory().unwrap()).unwrap());
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        runner as Arc<dyn JobRunner>,
    ));
    let engine = Arc::new(SchedulerEngine::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        4,
    ));
    (store, executor, engine)
}

async fn create_every(store: &JobStore, every_secs: u64) -> Job {
    store
        .create(NewJob {
            name: "periodic".to_string(),
            description: String::new(),
            trigger: Trigger::Every {
                every_secs,
                anchor: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            },
            payload: r#"{"topic":"daily digest"}"#.to_string(),
            timeout_secs: 5,
            enabled: true,
            delete_after_run: false,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn simulated_race_yields_exactly_one_execution() {
    let runner = CountingRunner::ok();
    let (store, executor, _engine) = harness(Arc::clone(&runner));
    let job = create_every(&store, 600).await;

    // Two dispatch attempts for the same job at the same time — e.g. a
    // run-now racing the schedule.
    let (a, b) = tokio::join!(
        executor.run(&job, RunCause::Schedule),
        executor.run(&job, RunCause::Manual),
    );

    let outcomes = [a, b];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let rejections = outcomes
        .iter()
        .filter(|r| matches!(r, Err(SchedulerError::AlreadyRunning { .. })))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(rejections, 1);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.list_runs(&job.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn run_now_executes_immediately_despite_far_schedule() {
    let runner = CountingRunner::ok();
    let (store, executor, _engine) = harness(Arc::clone(&runner));
    // Hourly grid — next slot is up to an hour away, nowhere near due.
    let job = create_every(&store, 3600).await;
    assert!(job.next_run_at.unwrap() > Utc::now());

    let record = executor.run(&job, RunCause::Manual).await.unwrap();
    assert_eq!(record.status, RunStatus::Ok);
    assert_eq!(record.cause, RunCause::Manual);
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

    // The regular cadence is recomputed fresh, still on the anchor grid.
    let loaded = store.get(&job.id).await.unwrap();
    let anchor = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    assert_eq!((loaded.next_run_at.unwrap() - anchor).num_seconds() % 3600, 0);
}

#[tokio::test]
async fn retry_after_failures_reschedules_to_now() {
    let runner = CountingRunner::failing();
    let (store, executor, engine) = harness(Arc::clone(&runner));
    let job = create_every(&store, 3600).await;

    // Two failures push next_run_at out on the backoff ladder.
    executor.run(&job, RunCause::Manual).await.unwrap();
    executor.run(&job, RunCause::Manual).await.unwrap();
    let backed_off = store.get(&job.id).await.unwrap();
    assert_eq!(backed_off.consecutive_errors, 2);

    // The management retry: counters zeroed, due immediately.
    let reset = store.reset_errors(&job.id, Utc::now()).await.unwrap();
    assert_eq!(reset.consecutive_errors, 0);

    engine.tick().await.unwrap();
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if store.status_summary().await.unwrap().running == 0 {
            break;
        }
    }
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn pause_removes_job_from_next_due_set() {
    let runner = CountingRunner::ok();
    let (store, _executor, engine) = harness(Arc::clone(&runner));
    let job = create_every(&store, 600).await;
    store
        .set_next_run(&job.id, Utc::now() - Duration::minutes(1))
        .await
        .unwrap();

    // An API pause lands before the tick — the due scan must not see the job.
    store
        .update(
            &job.id,
            cadence_scheduler::JobPatch {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    engine.tick().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn engine_loop_stops_on_shutdown_signal() {
    let runner = CountingRunner::ok();
    let (_store, _executor, engine) = harness(runner);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(engine.run(shutdown_rx));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

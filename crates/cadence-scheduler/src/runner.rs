use async_trait::async_trait;

/// The external execution callback — the work a job performs.
///
/// The engine stores the payload opaque and hands it back here unopened; it
/// does not know or care what the callback does. Errors are reported as text:
/// the Executor records them on the job and retries on the backoff ladder.
/// The per-job timeout is enforced by the Executor, not the runner.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, payload: &str) -> Result<(), String>;
}

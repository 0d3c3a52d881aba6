//! Execution callbacks for the gateway binary.

use async_trait::async_trait;
use cadence_scheduler::JobRunner;
use tracing::debug;

/// POSTs the opaque job payload to a configured callback URL. A non-2xx
/// response is a failure; the per-job timeout is enforced by the Executor,
/// so the client itself carries none.
pub struct HookRunner {
    client: reqwest::Client,
    url: String,
}

impl HookRunner {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl JobRunner for HookRunner {
    async fn run(&self, payload: &str) -> Result<(), String> {
        debug!(url = %self.url, "firing execution callback");
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| format!("callback request failed: {e}"))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("callback returned {status}"))
        }
    }
}

/// Placeholder when no callback URL is configured — every execution fails
/// with a configuration hint instead of silently succeeding.
pub struct NullRunner;

#[async_trait]
impl JobRunner for NullRunner {
    async fn run(&self, _payload: &str) -> Result<(), String> {
        Err("no execution callback configured — set executor.callback_url in cadence.toml".to_string())
    }
}

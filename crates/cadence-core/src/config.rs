use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Engine tuning constants — shared by the scheduler loop and the gateway
pub const DEFAULT_PORT: u16 = 18650;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Hard cap on how long the scheduler sleeps between wakeups. Bounds the
/// latency between an API edit and the engine noticing it.
pub const MAX_SLEEP_SECS: u64 = 60;
/// A `running_at` marker older than this means the holder crashed.
pub const STALL_THRESHOLD_SECS: i64 = 2 * 60 * 60;
/// Missed one-shot jobs older than this on startup are skipped, not caught up.
/// Deliberately equal to the stall threshold.
pub const STARTUP_GRACE_SECS: i64 = STALL_THRESHOLD_SECS;
/// Schedule recomputation failures before a job is force-disabled.
pub const SCHEDULE_ERROR_LIMIT: u32 = 3;
/// Per-job execution timeout when the caller does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default bound on concurrently in-flight executions per tick.
pub const MAX_CONCURRENT_RUNS: usize = 4;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum executions dispatched concurrently from one tick.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: MAX_CONCURRENT_RUNS,
        }
    }
}

/// Where fired jobs are delivered. The payload is POSTed unopened to
/// `callback_url`; when unset, executions fail with a configuration hint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    pub callback_url: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_max_concurrent() -> usize {
    MAX_CONCURRENT_RUNS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("_"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

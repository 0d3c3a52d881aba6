use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{Executor, JobStore, SchedulerEngine};

mod app;
mod hook;
mod http;

#[derive(Parser)]
#[command(name = "cadence-gateway", about = "Job scheduling engine with a REST management surface")]
struct Cli {
    /// Path to the config file (default: ~/.cadence/cadence.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config flag > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli.config.or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    let store = Arc::new(JobStore::new(db)?);

    // execution callback — without a URL every run fails with a config hint
    let runner: Arc<dyn cadence_scheduler::JobRunner> = match config.executor.callback_url {
        Some(ref url) => {
            info!(url = %url, "execution callback configured");
            Arc::new(hook::HookRunner::new(url.clone()))
        }
        None => {
            tracing::warn!("no executor.callback_url configured — job executions will fail");
            Arc::new(hook::NullRunner)
        }
    };

    let executor = Arc::new(Executor::new(Arc::clone(&store), runner));

    // background engine: startup recovery, then the tick/sleep loop
    let engine = Arc::new(SchedulerEngine::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        config.scheduler.max_concurrent,
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));

    let state = Arc::new(app::AppState::new(config, store, executor));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!(%addr, "cadence gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    // serve returned — stop the engine before exiting
    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;

    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

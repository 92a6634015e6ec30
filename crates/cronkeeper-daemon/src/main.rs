use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cronkeeper_core::CronkeeperConfig;
use cronkeeper_scheduler::{Scheduler, SqliteStore};
use tracing::{info, warn};

/// cronkeeper scheduler daemon.
#[derive(Debug, Parser)]
#[command(name = "cronkeeperd", version, about)]
struct Cli {
    /// Config file (default: $CRONKEEPER_CONFIG, then ~/.cronkeeper/cronkeeper.toml).
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Override `[scheduler] tick_secs`.
    #[arg(long)]
    tick_secs: Option<u64>,

    /// Start with dispatching paused.
    #[arg(long)]
    paused: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cronkeeper=info,cronkeeper_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > CRONKEEPER_CONFIG env > ~/.cronkeeper/cronkeeper.toml
    let mut config = CronkeeperConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CronkeeperConfig::default()
    });
    if let Some(tick_secs) = cli.tick_secs {
        config.scheduler.tick_secs = tick_secs;
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)
        .with_context(|| format!("failed to open database {db_path}"))?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteStore::new(db)?);

    let scheduler = Arc::new(Scheduler::new(
        &config.scheduler,
        store.clone(),
        store,
    )?);
    if cli.paused {
        scheduler.pause();
    }

    let status = scheduler.get_status();
    info!(
        tasks = status.tasks_count,
        paused = status.paused,
        "cronkeeper daemon starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine = tokio::spawn(scheduler.clone().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, stopping");

    // signal the trigger loop to stop and wait for it to drain
    let _ = shutdown_tx.send(true);
    engine.await?;

    let status = scheduler.get_status();
    info!(run_count = status.run_count, "cronkeeper daemon stopped");
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

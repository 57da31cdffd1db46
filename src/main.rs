use std::sync::Arc;

use tracing::info;

use parkd::config::Config;
use parkd::engine::Engine;
use parkd::notify::LogNotifier;
use parkd::sweeper::{self, Sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    parkd::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("parkd.wal");
    let engine = Arc::new(Engine::open(
        wal_path.clone(),
        Arc::new(LogNotifier),
        config.engine.clone(),
    )?);

    info!("parkd started");
    info!("  wal: {}", wal_path.display());
    info!("  sweep interval: {:?}", config.sweep_interval);
    info!("  default policy: {}", config.engine.default_policy.as_str());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeper = Arc::new(Sweeper::new(engine.clone()));
    tokio::spawn(sweeper::run_sweeper(sweeper, config.sweep_interval));
    tokio::spawn(sweeper::run_compactor(engine.clone(), config.compact_threshold));

    shutdown_signal().await?;
    info!("shutdown signal received");

    // Leave a compact log behind so the next start replays quickly.
    if let Err(e) = engine.compact().await {
        tracing::error!("final WAL compaction failed: {e}");
    }
    info!("parkd stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use roombook::config::Config;
use roombook::notify::NotifyHub;
use roombook::{Engine, SystemClock, observability, sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        notify.clone(),
        Arc::new(SystemClock),
        config.engine_settings()?,
    )?);

    info!("roombook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  sweep every {:?}, reminders {}h ahead", config.sweep_interval, config.reminder_lead.num_hours());
    info!("  compaction after {} appends", config.compact_threshold);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let sweeper = tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval, config.reminder_lead));
    let compactor = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    // Stand-in dispatcher: every persisted event as one JSON log line.
    let mut events = notify.subscribe_all();
    let dispatcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(kind = event.kind(), "{json}"),
                    Err(e) => warn!("cannot encode {} event: {e}", event.kind()),
                },
                Err(RecvError::Lagged(n)) => warn!("dispatcher lagged, {n} events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweeper.abort();
    compactor.abort();
    dispatcher.abort();
    if let Err(e) = engine.compact_wal().await {
        warn!("final compaction failed: {e}");
    }
    info!("roombook stopped");
    Ok(())
}

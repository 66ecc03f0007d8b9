//! Receiver daemon entry point

use audiovault_core::config::Config;
use audiovault_core::events::EventBus;
use audiovault_core::metrics::MetricsRegistry;
use audiovault_core::monitor::Monitor;
use audiovault_core::storage::StorageManager;
use audiovault_server::pipeline::AudioPipeline;
use audiovault_server::server::ReceiverServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const EVENT_WORKERS: usize = 4;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            tracing::info!(path = %path, "Loading configuration");
            Config::load(&path)?
        }
        None => {
            tracing::info!("No config file given, using defaults");
            Config::default()
        }
    };

    tracing::info!(version = audiovault_core::VERSION, "Audiovault starting");

    let registry = MetricsRegistry::new();
    let events = Arc::new(EventBus::new(EVENT_WORKERS));
    let storage = Arc::new(StorageManager::with_events(&config, Arc::clone(&events)));
    let pipeline = Arc::new(AudioPipeline::new(
        &config,
        Arc::clone(&storage),
        registry.clone(),
        Arc::clone(&events),
    ));

    let mut monitor = Monitor::with_events(
        config.monitor.clone(),
        registry.clone(),
        Arc::clone(&events),
    );
    monitor.start();

    let mut server = ReceiverServer::new(config.clone(), Arc::clone(&pipeline));
    server.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        flag.store(true, Ordering::SeqCst);
    })?;

    let mut last_cleanup = std::time::Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));

        // Retention cleanup once per hour
        if last_cleanup.elapsed() >= Duration::from_secs(3600) {
            last_cleanup = std::time::Instant::now();
            match storage.cleanup_old_segments() {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "Retention cleanup"),
                Err(err) => tracing::error!(error = %err, "Retention cleanup failed"),
            }
        }
    }

    server.stop();
    monitor.stop();
    let completed = storage.complete_all();
    events.shutdown();

    let stats = storage.stats();
    tracing::info!(
        segments_completed = stats.segments_completed,
        bytes_written = stats.bytes_written,
        finalized_at_shutdown = completed.len(),
        "Audiovault stopped"
    );
    Ok(())
}

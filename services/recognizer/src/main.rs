use anyhow::{Context, Result};
use plate_recognizer::api::start_api_server;
use plate_recognizer::{
    build_recognizer, AppState, CaptureProcessor, CaptureWatcher, Config, ContourPlateDetector,
    LatestSnapshot, PlateDetector, QueryService, RecordStore, RetentionSweeper,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        drop_dir = %config.watcher.drop_dir.display(),
        "Starting plate recognizer"
    );

    // Initialize metrics
    if config.service.metrics_port > 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let store = Arc::new(
        RecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let recognizer =
        build_recognizer(&config.detector.ocr).context("Failed to initialize OCR backend")?;
    let detector: Arc<dyn PlateDetector> =
        Arc::new(ContourPlateDetector::new(&config.detector, recognizer));

    let snapshot = Arc::new(LatestSnapshot::new());
    let processor = Arc::new(CaptureProcessor::new(
        &config,
        detector,
        snapshot.clone(),
        store.clone(),
    ));

    let watcher = CaptureWatcher::new(&config.watcher, processor);
    let sweeper = RetentionSweeper::new(&config.retention, &config.archive.root);

    let query = Arc::new(QueryService::new(
        store.clone(),
        snapshot,
        &config.archive.public_root,
    ));
    let api_state = AppState::new(query, &config.api);

    let cancel = CancellationToken::new();

    // Spawn supervised watcher and retention tasks
    let watcher_handle = tokio::spawn(watcher.run(cancel.clone()));
    let sweeper_handle = tokio::spawn(sweeper.run(cancel.clone()));

    // Spawn API server task
    let api_config = config.api.clone();
    let public_root = config.archive.public_root.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, public_root).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Plate recognizer started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down plate recognizer");

    cancel.cancel();
    api_handle.abort();

    for (name, handle) in [("watcher", watcher_handle), ("retention", sweeper_handle)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "Task ended abnormally");
        }
    }

    store.pool().close().await;

    info!("Plate recognizer stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

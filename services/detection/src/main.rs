use anyhow::{Context, Result};
use detection_service::api::{start_api_server, AppState};
use detection_service::{
    ArtifactLocator, Config, JobOrchestrator, ProcessRunner, S3Publisher, UploadStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Nier Detection Service"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    // Initialize components
    let base_dir = std::env::current_dir().context("Failed to resolve working directory")?;

    let upload_store = Arc::new(
        UploadStore::new(&base_dir.join(&config.uploads.dir))
            .context("Failed to initialize upload store")?,
    );

    let publisher = Arc::new(S3Publisher::new(&config.s3).await);
    if let Err(e) = publisher.check_bucket().await {
        warn!(error = %e, bucket = %config.s3.bucket, "S3 bucket not reachable at startup");
    }

    let runner = ProcessRunner::new(&config.detector);

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let search_bases = config.detector.search_bases(&base_dir, exe_dir.as_deref());
    let locator = ArtifactLocator::new(&config.locator, &search_bases, upload_store.dir());

    let orchestrator = Arc::new(
        JobOrchestrator::new(
            runner,
            locator,
            publisher,
            config.detector.max_concurrent_jobs,
        )
        .with_pending_uploads(upload_store.pending().clone()),
    );

    // Create API state
    let api_state = AppState {
        upload_store,
        orchestrator,
        results_dir: search_bases.first().unwrap_or(&base_dir).join("runs"),
    };

    info!("Detection service started successfully");

    start_api_server(api_state, &config.api, shutdown_signal()).await?;

    info!("Detection service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
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

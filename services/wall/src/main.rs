use anyhow::{Context, Result};
use event_wall::api::{start_api_server, AppState};
use event_wall::{Backend, Config, PhotoWall, WallOptions};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.backend.kind,
        "Starting Event Wall service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize storage
    let backend = Backend::connect(&config)
        .await
        .context("Failed to initialize storage backend")?;

    let wall = PhotoWall::new(backend, WallOptions::from_config(&config))
        .await
        .context("Failed to initialize photo wall")?;

    // Follow changes made by other instances sharing the backend
    let feed_handle = wall.start_feed(&config.feed);

    // Spawn API server task
    let api_state = AppState { wall: wall.clone() };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Event Wall service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down Event Wall service");

    // Abort tasks
    feed_handle.abort();
    api_handle.abort();

    info!("Event Wall service stopped");

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

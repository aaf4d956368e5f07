use analysis_service::{
    start_api_server, AnalysisInvoker, AppState, BatchUploadCoordinator, Config, LifecycleManager,
    Locale, OpenAiVision, PgRecordStore, RetentionSweeper, S3BlobGateway,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting SiteEye Analysis Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let record_store = Arc::new(
        PgRecordStore::new(&config.database)
            .await
            .context("Failed to initialize record store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        record_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_gateway = Arc::new(
        S3BlobGateway::new(&config.blob)
            .await
            .context("Failed to initialize blob gateway")?,
    );

    let vision = Arc::new(
        OpenAiVision::new(&config.vision, config.vision_timeout())
            .context("Failed to initialize vision client")?,
    );
    let invoker = Arc::new(AnalysisInvoker::new(vision, config.vision_timeout()));

    let default_locale = Locale::resolve(Some(config.batch.default_locale.as_str()));
    if default_locale.tag() != config.batch.default_locale {
        warn!(
            configured = %config.batch.default_locale,
            resolved = %default_locale,
            "Default locale normalized"
        );
    }

    let coordinator = Arc::new(BatchUploadCoordinator::new(
        record_store.clone(),
        blob_gateway.clone(),
        invoker,
        &config.batch,
        config.blob.key_prefix.clone(),
    ));
    let lifecycle = Arc::new(LifecycleManager::new(
        record_store.clone(),
        blob_gateway.clone(),
    ));
    let sweeper = Arc::new(RetentionSweeper::new(
        record_store.clone(),
        lifecycle.clone(),
        config.retention_window(),
    ));

    // Create API state
    let api_state = AppState {
        store: record_store.clone(),
        coordinator,
        lifecycle,
        sweeper: sweeper.clone(),
        default_locale,
        maintenance_token: config.api.maintenance_token.clone(),
    };
    if api_state.maintenance_token.is_none() {
        warn!("No maintenance token configured, trash sweeping endpoint is disabled");
    }

    let shutdown = CancellationToken::new();

    // Spawn retention sweeper task
    let sweeper_handle = if config.retention.sweep_enabled {
        let interval = config.sweep_interval();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            sweeper.run_periodic(interval, token).await;
        }))
    } else {
        info!("Scheduled retention sweeping disabled");
        None
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, async move {
            api_shutdown.cancelled().await
        })
        .await
        {
            error!(error = %e, "API server error");
        }
    });

    info!("Analysis service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down analysis service");

    shutdown.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }
    if let Some(handle) = sweeper_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Retention sweeper task failed");
        }
    }

    info!("Analysis service stopped");

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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

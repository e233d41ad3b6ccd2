use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use room_stager::app_state::AppState;
use room_stager::config::AppConfig;
use room_stager::routes;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing room-stager server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "staging_jobs_submitted_total",
        "Staging jobs accepted by the provider"
    );
    metrics::describe_counter!(
        "staging_jobs_completed_total",
        "Staging jobs that produced images"
    );
    metrics::describe_counter!("staging_jobs_failed_total", "Staging jobs that failed");
    metrics::describe_counter!(
        "staging_jobs_timed_out_total",
        "Staging jobs that exceeded the maximum wait"
    );
    metrics::describe_counter!(
        "staging_webhooks_received_total",
        "Webhook deliveries received from the provider"
    );
    metrics::describe_counter!(
        "staging_sweeper_reaped_total",
        "Resolved job records removed after retention"
    );
    metrics::describe_gauge!(
        "staging_jobs_in_flight",
        "Jobs submitted and not yet resolved"
    );
    metrics::describe_histogram!(
        "staging_job_duration_seconds",
        "Time from submission to resolution"
    );

    let shutdown = CancellationToken::new();
    let state = AppState::from_config(&config, shutdown.clone())
        .expect("Failed to initialize staging services");

    let sweeper = state.sweeper.clone().spawn(shutdown.clone());

    // Base64 inflates payloads by 4/3; leave room for the JSON envelope.
    let body_limit = config.max_image_bytes / 3 * 4 + 64 * 1024;
    let app = routes::router(state, Some(prometheus_handle), body_limit);

    tracing::info!("Starting room-stager on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .expect("Server error");

    let _ = sweeper.await;
    tracing::info!("Server stopped");
}

/// Resolves on Ctrl+C or SIGTERM and cancels every in-flight tracker.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}

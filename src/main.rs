use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use video_relay::app_state::AppState;
use video_relay::config::AppConfig;
use video_relay::db;
use video_relay::routes;
use video_relay::services::backoff::TokioSleeper;
use video_relay::services::credentials::CredentialPool;
use video_relay::services::lifecycle::Orchestrator;
use video_relay::services::poller::PollingEngine;
use video_relay::services::remote::SoraClient;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing video-relay server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("video_jobs_submitted_total", "Video jobs accepted by the remote service");
    metrics::describe_counter!(
        "video_jobs_terminal_total",
        "Polling runs that reached a terminal status, by status"
    );
    metrics::describe_counter!(
        "video_admission_rejected_total",
        "Submissions refused before contacting the remote service, by reason"
    );
    metrics::describe_gauge!("video_credentials_in_use", "Credential slots currently held");
    metrics::describe_histogram!("video_job_poll_seconds", "Wall time of a polling run");

    tracing::info!("Opening task ledger");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to open task ledger");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let secrets = config.credential_secrets();
    if secrets.is_empty() {
        tracing::warn!("No credentials configured, every submission will be rejected");
    }
    let credentials = CredentialPool::new(secrets, config.credential_ceiling);
    tracing::info!(
        credentials = credentials.len(),
        ceiling = credentials.ceiling(),
        "Credential pool ready"
    );

    let remote = Arc::new(
        SoraClient::new(&config.remote_base_url, &config.remote_model, config.proxy.as_deref())
            .expect("Failed to initialize remote client"),
    );

    let engine = PollingEngine::new(
        remote.clone(),
        db_pool.clone(),
        Arc::new(TokioSleeper),
        config.poll_settings().expect("Invalid polling settings"),
    );
    let orchestrator = Orchestrator::new(
        credentials,
        remote,
        db_pool.clone(),
        engine,
        config.cdn_rewrite().expect("Invalid CDN rewrite settings"),
    );

    match orchestrator.resume_pending().await {
        Ok(resumed) if resumed > 0 => tracing::info!(resumed, "Resumed polling for queued jobs"),
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Failed to resume queued jobs"),
    }

    let image_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build image download client");

    let state = AppState::new(
        db_pool,
        orchestrator.clone(),
        image_client,
        config.default_prompt.clone(),
        config.default_orientation().expect("Invalid default orientation"),
    );

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/videos", post(routes::videos::submit_video))
        .route("/api/v1/videos/{job_id}", get(routes::videos::get_video))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Queued jobs stay queued in the ledger and are resumed on the next start.
    orchestrator.shutdown();
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

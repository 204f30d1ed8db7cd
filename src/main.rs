use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use render_jobs::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        executor::{CommandRunner, ShellRunner},
        preview::PreviewGenerator,
        progress::{ProgressBus, ProgressSink},
        queue::{RedisTaskQueue, TaskQueue},
        reconciler::Reconciler,
        render::{RenderPaths, RenderService},
        store::{JobStore, RecordBackend, RedisBackend},
        worker::Worker,
    },
};

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

    tracing::info!("Initializing render-jobs server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Job records and task queue share one Redis instance
    tracing::info!("Connecting to Redis");
    let backend: Arc<dyn RecordBackend> =
        Arc::new(RedisBackend::new(&config.redis_url).expect("Failed to initialize job store"));
    let store = Arc::new(JobStore::new(
        backend,
        config.job_ttl(),
        config.cache_max_age(),
    ));
    let queue: Arc<dyn TaskQueue> =
        Arc::new(RedisTaskQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new(config.shell.clone()));
    let previews = PreviewGenerator::new(Arc::clone(&runner), config.preview_command.clone());
    let events = ProgressBus::new();
    let sink: Arc<dyn ProgressSink> = Arc::new(events.clone());

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        previews.clone(),
        Arc::clone(&sink),
    ));
    let _sweep = config.reconcile_interval().map(|every| {
        tracing::info!(every_secs = every.as_secs(), "Scheduling orphaned job cleanup");
        Arc::clone(&reconciler).spawn_periodic(every)
    });

    let paths = RenderPaths::new(config.uploads_dir.clone(), config.rendered_dir());
    let render = RenderService::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        reconciler,
        events,
        paths,
    );

    // Optional in-process worker pool; dropping the JoinSet would abort it
    let _worker_slots = if config.embedded_worker {
        let worker = Arc::new(Worker::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            runner,
            previews,
            sink,
            config.worker_settings(),
        ));
        let slots = worker.start().await;
        tracing::info!(slots = slots.len(), "Embedded render worker started");
        Some(slots)
    } else {
        None
    };

    // Create shared application state
    let state = AppState::new(render, store, queue);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/render",
            post(routes::render::submit_render).get(routes::render::list_jobs),
        )
        .route("/api/render/cleanup", post(routes::render::cleanup_jobs))
        .route(
            "/api/render/{job_id}",
            get(routes::render::get_job).delete(routes::render::delete_job),
        )
        .route(
            "/api/render/{job_id}/preview",
            get(routes::render::get_preview),
        )
        .route(
            "/api/download/{job_id}",
            get(routes::render::download_output),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting render-jobs on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

use render_jobs::{
    config::AppConfig,
    routes::metrics::describe_metrics,
    services::{
        executor::{CommandRunner, ShellRunner},
        preview::PreviewGenerator,
        progress::{ProgressBus, ProgressSink},
        queue::{RedisTaskQueue, TaskQueue},
        store::{JobStore, RecordBackend, RedisBackend},
        worker::Worker,
    },
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting render worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    describe_metrics();

    // Initialize services
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

    // Listeners live in the API process; here events only reach the log.
    let events = ProgressBus::new();
    let _log_progress = events.subscribe(|event| {
        tracing::debug!(
            job_id = %event.job_id,
            status = %event.status,
            progress = event.progress,
            "Progress event"
        );
    });
    let sink: Arc<dyn ProgressSink> = Arc::new(events);

    let settings = config.worker_settings();
    tracing::info!(
        concurrency = settings.concurrency,
        rendered_dir = %config.rendered_dir().display(),
        "Worker ready, starting job processing loop"
    );

    let worker = Arc::new(Worker::new(store, queue, runner, previews, sink, settings));
    // Tasks held by workers whose lease lapsed go back to the queue on start
    let mut slots = worker.start().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping worker");
        }
        Some(result) = slots.join_next() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task exited unexpectedly");
            }
        }
    }

    slots.abort_all();
}

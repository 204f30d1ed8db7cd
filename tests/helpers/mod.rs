//! Test harness wiring the render service against in-memory backends

#![allow(dead_code)]

use render_jobs::{
    models::job::{JobStatus, ProgressEvent, RenderJob},
    services::{
        executor::{CommandRunner, ShellRunner},
        preview::PreviewGenerator,
        progress::{ProgressBus, ProgressSink},
        queue::{MemoryTaskQueue, TaskQueue},
        reconciler::Reconciler,
        render::{RenderPaths, RenderService},
        store::{JobStore, MemoryBackend, RecordBackend},
        worker::{TaskOutcome, Worker, WorkerSettings},
    },
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use uuid::Uuid;

/// Preview command that copies the output, standing in for ffmpeg.
pub const COPY_PREVIEW: &str = "cp {input} {output}";

/// Render command that succeeds instantly.
pub const COPY_RENDER: &str = "cp {input} {output}";

pub struct Harness {
    pub dir: TempDir,
    pub backend: Arc<MemoryBackend>,
    pub store: Arc<JobStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub events: ProgressBus,
    pub reconciler: Arc<Reconciler>,
    pub render: RenderService,
    pub worker: Arc<Worker>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_preview(COPY_PREVIEW)
    }

    pub fn with_preview(preview_command: &str) -> Self {
        Self::build(preview_command, fast_settings())
    }

    pub fn build(preview_command: &str, settings: WorkerSettings) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let uploads = dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).expect("Failed to create uploads dir");

        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(JobStore::new(
            Arc::clone(&backend) as Arc<dyn RecordBackend>,
            Duration::from_secs(3600),
            Duration::from_secs(1),
        ));
        let queue = Arc::new(MemoryTaskQueue::new());
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::default());
        let previews = PreviewGenerator::new(Arc::clone(&runner), preview_command);
        let events = ProgressBus::new();
        let sink: Arc<dyn ProgressSink> = Arc::new(events.clone());

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            previews.clone(),
            Arc::clone(&sink),
        ));
        let render = RenderService::new(
            Arc::clone(&store),
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            Arc::clone(&reconciler),
            events.clone(),
            RenderPaths::new(uploads.clone(), uploads.join("rendered")),
        );
        let worker = Arc::new(Worker::new(
            Arc::clone(&store),
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            runner,
            previews,
            sink,
            settings,
        ));

        Self {
            dir,
            backend,
            store,
            queue,
            events,
            reconciler,
            render,
            worker,
        }
    }

    pub fn uploads(&self) -> PathBuf {
        self.render.paths().uploads_dir().to_path_buf()
    }

    /// Write an input file under the uploads root and return its relative path.
    pub fn write_input(&self, name: &str, contents: &[u8]) -> String {
        std::fs::write(self.uploads().join(name), contents).expect("Failed to write input");
        name.to_string()
    }

    /// Dequeue and execute one task, acknowledging it afterwards.
    pub async fn run_next(&self) -> Option<TaskOutcome> {
        let task = self.queue.dequeue().await.expect("dequeue failed")?;
        let outcome = self.worker.execute(&task).await;
        self.queue.complete(&task).await.expect("complete failed");
        Some(outcome)
    }

    /// Submit a job and run it to a terminal state.
    pub async fn render_now(&self, filename: &str, command: &str) -> RenderJob {
        let input = self.write_input(filename, b"frames");
        let id = self
            .render
            .submit(filename, &input, command)
            .await
            .expect("submit failed");
        self.run_next().await.expect("task was not queued");
        self.render.get_job(id).await.expect("job vanished")
    }

    /// A second worker process: shares the store and queue lists, with its own consumer.
    pub fn second_worker(&self) -> Arc<Worker> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::default());
        let previews = PreviewGenerator::new(Arc::clone(&runner), COPY_PREVIEW);
        Arc::new(Worker::new(
            Arc::clone(&self.store),
            Arc::new(self.queue.consumer()),
            runner,
            previews,
            Arc::new(self.events.clone()),
            fast_settings(),
        ))
    }

    /// Record every progress event published from now on.
    pub fn record_events(&self) -> Arc<Mutex<Vec<ProgressEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = self.events.subscribe(move |event| {
            sink.lock().expect("event log poisoned").push(event.clone());
        });
        seen
    }
}

/// Fast ticks so progress is observable within a short command.
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        concurrency: 1,
        poll_interval: Duration::from_millis(10),
        progress_tick: Duration::from_millis(20),
        progress_step: 10,
        lease_ttl: Duration::from_secs(5),
    }
}

/// Poll until the job reaches a terminal state or the timeout elapses.
pub async fn wait_for_terminal(render: &RenderService, job_id: Uuid, timeout: Duration) -> RenderJob {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = render.get_job(job_id).await.expect("job vanished");
        if matches!(job.status(), JobStatus::Completed | JobStatus::Failed) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Job {job_id} still {} after {timeout:?}",
            job.status()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

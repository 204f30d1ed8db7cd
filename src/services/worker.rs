use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::{interval, sleep, MissedTickBehavior};
use uuid::Uuid;

use crate::models::job::{JobMetadata, JobUpdate, ProgressEvent, RenderJob, PROGRESS_CEILING};
use crate::services::executor::{CommandRunner, ExecutionError};
use crate::services::preview::{preview_path, PreviewGenerator};
use crate::services::progress::ProgressSink;
use crate::services::queue::{QueueError, RenderTask, TaskQueue};
use crate::services::store::JobStore;

/// Tuning for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Tasks executed concurrently by one worker process.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Interval of the synthetic progress ticker.
    pub progress_tick: Duration,
    /// Progress added on every tick, up to the ceiling.
    pub progress_step: u8,
    /// How long delivered tasks stay reserved without a heartbeat.
    pub lease_ttl: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(1000),
            progress_tick: Duration::from_millis(1000),
            progress_step: 10,
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// How a delivered task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    /// The record was missing or already terminal; nothing ran.
    Skipped,
    /// The record was deleted while the command ran; artifacts were removed.
    Abandoned,
}

/// Consumes render tasks, runs the external command and records every transition.
pub struct Worker {
    store: Arc<JobStore>,
    queue: Arc<dyn TaskQueue>,
    runner: Arc<dyn CommandRunner>,
    previews: PreviewGenerator,
    events: Arc<dyn ProgressSink>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<dyn TaskQueue>,
        runner: Arc<dyn CommandRunner>,
        previews: PreviewGenerator,
        events: Arc<dyn ProgressSink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            runner,
            previews,
            events,
            settings,
        }
    }

    /// Take the queue lease, recover tasks abandoned by dead workers, then
    /// start the heartbeat and one processing loop per concurrency slot.
    pub async fn start(self: &Arc<Self>) -> JoinSet<()> {
        self.renew_lease().await;
        self.recover_abandoned().await;

        let mut tasks = JoinSet::new();
        let worker = Arc::clone(self);
        tasks.spawn(async move { worker.run_heartbeat().await });
        for slot in 0..self.settings.concurrency.max(1) {
            let worker = Arc::clone(self);
            tasks.spawn(async move { worker.run_slot(slot).await });
        }
        tasks
    }

    async fn run_heartbeat(&self) {
        let mut ticker = interval((self.settings.lease_ttl / 3).max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.renew_lease().await;
            self.recover_abandoned().await;
        }
    }

    async fn renew_lease(&self) {
        if let Err(e) = self.queue.heartbeat(self.settings.lease_ttl).await {
            tracing::error!(error = %e, "Failed to renew queue lease");
        }
    }

    async fn recover_abandoned(&self) {
        match self.queue.requeue_abandoned().await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(requeued = n, "Re-queued tasks abandoned by dead workers"),
            Err(e) => tracing::error!(error = %e, "Failed to re-queue abandoned render tasks"),
        }
    }

    async fn run_slot(&self, slot: usize) {
        tracing::info!(slot, "Worker slot ready, starting job processing loop");
        loop {
            match self.process_next().await {
                Ok(true) => {
                    tracing::debug!(slot, "Job processed, checking for next job");
                }
                Ok(false) => {
                    tracing::trace!(slot, "No jobs available, sleeping");
                    sleep(self.settings.poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(slot, error = %e, "Error reading render queue, will retry");
                    sleep(self.settings.poll_interval).await;
                }
            }
        }
    }

    /// Process the next task from the queue.
    /// Returns Ok(true) if a task was handled, Ok(false) if the queue was empty.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        let task = match self.queue.dequeue().await? {
            Some(t) => t,
            None => return Ok(false),
        };

        self.execute(&task).await;
        self.queue.complete(&task).await?;

        if let Ok(depth) = self.queue.depth().await {
            metrics::gauge!("render_queue_depth").set(depth as f64);
        }
        Ok(true)
    }

    /// Run one task to a terminal state. Execution errors end up in the job record.
    pub async fn execute(&self, task: &RenderTask) -> TaskOutcome {
        match self.store.get(task.job_id).await {
            None => {
                tracing::warn!(job_id = %task.job_id, "Render task has no job record, skipping");
                return TaskOutcome::Skipped;
            }
            Some(job) if job.is_terminal() => {
                tracing::info!(
                    job_id = %task.job_id,
                    status = %job.status(),
                    "Render task redelivered for finished job, skipping"
                );
                return TaskOutcome::Skipped;
            }
            Some(_) => {}
        }

        let job = match self.transition(task.job_id, JobUpdate::StartProcessing).await {
            Applied::Saved(job) => job,
            Applied::Missing | Applied::Rejected => return TaskOutcome::Skipped,
        };

        tracing::info!(
            job_id = %task.job_id,
            filename = %task.filename,
            input = %task.input_path.display(),
            output = %task.output_path.display(),
            "Processing render job"
        );

        let started = Instant::now();
        let run = self.run_render(task, job.progress).await;
        let elapsed = started.elapsed();

        let outcome = match run {
            Ok(RenderRun { record_gone: true }) => TaskOutcome::Abandoned,
            Ok(RenderRun { record_gone: false }) => self.finish_success(task, elapsed).await,
            Err(e) => self.finish_failure(task, e).await,
        };

        if outcome == TaskOutcome::Abandoned {
            tracing::warn!(
                job_id = %task.job_id,
                "Job deleted while rendering, removing produced artifacts"
            );
            remove_artifacts(task.job_id, &task.output_path).await;
        }
        outcome
    }

    async fn run_render(
        &self,
        task: &RenderTask,
        initial_progress: u8,
    ) -> Result<RenderRun, ExecutionError> {
        if !tokio::fs::try_exists(&task.input_path).await.unwrap_or(false) {
            return Err(ExecutionError::InputNotFound(task.input_path.clone()));
        }

        if let Some(dir) = task.output_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ExecutionError::OutputDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let mut ticker = interval(self.settings.progress_tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let command = self.runner.run(&task.command);
        tokio::pin!(command);

        let mut progress = initial_progress;
        let mut record_gone = false;
        let result = loop {
            tokio::select! {
                result = &mut command => break result,
                _ = ticker.tick(), if !record_gone => {
                    let next = progress
                        .saturating_add(self.settings.progress_step)
                        .min(PROGRESS_CEILING);
                    if next <= progress {
                        continue;
                    }
                    match self.transition(task.job_id, JobUpdate::Progress(next)).await {
                        Applied::Saved(job) => progress = job.progress,
                        Applied::Missing => record_gone = true,
                        Applied::Rejected => progress = PROGRESS_CEILING,
                    }
                }
            }
        };

        match result {
            Ok(output) => {
                if !output.stderr.is_empty() {
                    tracing::warn!(job_id = %task.job_id, stderr = %output.stderr, "Render command wrote to stderr");
                }
                Ok(RenderRun { record_gone })
            }
            Err(_) if record_gone => Ok(RenderRun { record_gone }),
            Err(e) => Err(e),
        }
    }

    async fn finish_success(&self, task: &RenderTask, elapsed: Duration) -> TaskOutcome {
        if let Err(e) = self.previews.generate(task.job_id, &task.output_path).await {
            tracing::warn!(job_id = %task.job_id, error = %e, "Failed to generate preview");
        }

        let update = JobUpdate::Complete {
            output_path: task.output_path.clone(),
            metadata: Some(output_metadata(&task.output_path).await),
        };
        match self.transition(task.job_id, update).await {
            Applied::Saved(_) => {}
            Applied::Missing => return TaskOutcome::Abandoned,
            Applied::Rejected => return TaskOutcome::Skipped,
        }

        metrics::counter!("render_jobs_completed_total").increment(1);
        metrics::histogram!("render_job_duration_seconds").record(elapsed.as_secs_f64());
        tracing::info!(
            job_id = %task.job_id,
            duration_ms = elapsed.as_millis() as u64,
            "Render job completed successfully"
        );
        TaskOutcome::Completed
    }

    async fn finish_failure(&self, task: &RenderTask, error: ExecutionError) -> TaskOutcome {
        tracing::error!(job_id = %task.job_id, error = %error, "Render job failed");

        let update = JobUpdate::Fail {
            error: error.to_string(),
        };
        match self.transition(task.job_id, update).await {
            Applied::Saved(_) => {}
            Applied::Missing => return TaskOutcome::Abandoned,
            Applied::Rejected => return TaskOutcome::Skipped,
        }

        metrics::counter!("render_jobs_failed_total").increment(1);
        TaskOutcome::Failed
    }

    /// Persist an update and notify listeners.
    async fn transition(&self, job_id: Uuid, update: JobUpdate) -> Applied {
        let progress_only = matches!(update, JobUpdate::Progress(_));
        match self.store.update(job_id, update).await {
            Ok(Some(job)) => {
                self.events.publish(&ProgressEvent::snapshot(&job));
                if progress_only {
                    tracing::trace!(job_id = %job_id, progress = job.progress, "Render progress");
                }
                Applied::Saved(job)
            }
            Ok(None) => Applied::Missing,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Rejected job update");
                Applied::Rejected
            }
        }
    }
}

enum Applied {
    Saved(RenderJob),
    /// The record was deleted.
    Missing,
    /// The state machine refused the update, e.g. another delivery already finished the job.
    Rejected,
}

struct RenderRun {
    record_gone: bool,
}

async fn output_metadata(output_path: &Path) -> JobMetadata {
    let file_size = tokio::fs::metadata(output_path).await.ok().map(|m| m.len());
    let format = output_path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    JobMetadata { file_size, format }
}

/// Best-effort removal of a job's output and preview files.
pub async fn remove_artifacts(job_id: Uuid, output_path: &Path) {
    for path in [output_path.to_path_buf(), preview_path(output_path, job_id)] {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(job_id = %job_id, path = %path.display(), "Deleted file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(job_id = %job_id, path = %path.display(), "File already gone");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, path = %path.display(), error = %e, "Failed to delete file");
            }
        }
    }
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::models::job::{JobStatus, ProgressEvent, ProgressStage, RenderJob};
use crate::services::preview::PreviewGenerator;
use crate::services::progress::ProgressSink;
use crate::services::store::JobStore;

/// Aligns persisted completed jobs with the files they point at.
pub struct Reconciler {
    store: Arc<JobStore>,
    previews: PreviewGenerator,
    events: Arc<dyn ProgressSink>,
}

impl Reconciler {
    pub fn new(
        store: Arc<JobStore>,
        previews: PreviewGenerator,
        events: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            store,
            previews,
            events,
        }
    }

    /// Drop completed jobs whose output vanished and repair missing previews.
    /// Jobs in any other state pass through untouched.
    pub async fn sync(&self, jobs: Vec<RenderJob>) -> Vec<RenderJob> {
        let mut kept = Vec::with_capacity(jobs.len());

        for job in jobs {
            let Some(output_path) = completed_output(&job) else {
                kept.push(job);
                continue;
            };

            match output_exists(output_path).await {
                Some(false) => {
                    self.discard(&job).await;
                    continue;
                }
                Some(true) => match self.previews.ensure(job.id, output_path).await {
                    Ok(true) => tracing::info!(job_id = %job.id, "Regenerated missing preview"),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to regenerate preview")
                    }
                },
                None => {}
            }
            kept.push(job);
        }

        kept
    }

    /// Remove every persisted completed job whose output file is gone.
    /// Returns the number of records removed.
    pub async fn cleanup_orphaned_jobs(&self) -> usize {
        let mut cleaned = 0;
        for job in self.store.list_all().await {
            let Some(output_path) = completed_output(&job) else {
                continue;
            };
            if output_exists(output_path).await == Some(false) {
                self.discard(&job).await;
                cleaned += 1;
            }
        }

        tracing::info!(cleaned, "Cleaned up orphaned jobs");
        cleaned
    }

    /// Run `cleanup_orphaned_jobs` every `every` until the handle is aborted.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // Skip the immediate first tick.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.cleanup_orphaned_jobs().await;
            }
        })
    }

    async fn discard(&self, job: &RenderJob) {
        tracing::warn!(
            job_id = %job.id,
            filename = %job.filename,
            "Cleaning up orphaned job, output file is gone"
        );
        self.store.delete(job.id).await;
        metrics::counter!("render_jobs_orphans_removed_total").increment(1);
        self.events
            .publish(&ProgressEvent::for_job(job, ProgressStage::Discarded));
    }
}

fn completed_output(job: &RenderJob) -> Option<&Path> {
    if job.status() != JobStatus::Completed {
        return None;
    }
    job.output_path()
}

/// `None` when the filesystem could not answer; such records are kept.
async fn output_exists(path: &Path) -> Option<bool> {
    match tokio::fs::try_exists(path).await {
        Ok(exists) => Some(exists),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not check output file");
            None
        }
    }
}

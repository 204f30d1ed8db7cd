use std::path::{Path, PathBuf};
use std::sync::Arc;

use garde::Validate;
use uuid::Uuid;

use crate::error::RenderError;
use crate::models::job::{ProgressEvent, RenderJob};
use crate::models::render::SubmitRequest;
use crate::services::executor::substitute_placeholders;
use crate::services::progress::{ProgressBus, ProgressSink, Subscription};
use crate::services::queue::{RenderTask, TaskQueue};
use crate::services::reconciler::Reconciler;
use crate::services::store::JobStore;
use crate::services::worker::remove_artifacts;

/// Filesystem layout for inputs and rendered artifacts.
#[derive(Debug, Clone)]
pub struct RenderPaths {
    uploads_dir: PathBuf,
    rendered_dir: PathBuf,
}

impl RenderPaths {
    pub fn new(uploads_dir: impl Into<PathBuf>, rendered_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            rendered_dir: rendered_dir.into(),
        }
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn rendered_dir(&self) -> &Path {
        &self.rendered_dir
    }

    /// Relative inputs live under the uploads root; absolute ones are used as given.
    pub fn resolve_input(&self, input_path: &str) -> PathBuf {
        let path = Path::new(input_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.uploads_dir.join(path)
        }
    }

    /// Output location for a job. The id prefix keeps concurrent jobs from sharing a file.
    pub fn output_for(&self, job_id: Uuid, filename: &str) -> PathBuf {
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());
        self.rendered_dir.join(format!("{job_id}_rendered_{name}"))
    }
}

/// Render job orchestration: submission, lookup, listing, deletion and cleanup.
pub struct RenderService {
    store: Arc<JobStore>,
    queue: Arc<dyn TaskQueue>,
    reconciler: Arc<Reconciler>,
    events: ProgressBus,
    paths: RenderPaths,
}

impl RenderService {
    pub fn new(
        store: Arc<JobStore>,
        queue: Arc<dyn TaskQueue>,
        reconciler: Arc<Reconciler>,
        events: ProgressBus,
        paths: RenderPaths,
    ) -> Self {
        Self {
            store,
            queue,
            reconciler,
            events,
            paths,
        }
    }

    pub fn paths(&self) -> &RenderPaths {
        &self.paths
    }

    /// Queue a render of `input_path` and return the new job id.
    pub async fn submit(
        &self,
        filename: &str,
        input_path: &str,
        command_template: &str,
    ) -> Result<Uuid, RenderError> {
        self.submit_request(SubmitRequest {
            filename: filename.to_string(),
            file_path: input_path.to_string(),
            render_command: command_template.to_string(),
            parent_folder_path: None,
        })
        .await
    }

    /// Validate, record and enqueue a render job. Returns as soon as the task is queued.
    pub async fn submit_request(&self, request: SubmitRequest) -> Result<Uuid, RenderError> {
        request
            .validate()
            .map_err(|e| RenderError::Validation(e.to_string()))?;

        let job = RenderJob::new(
            request.filename,
            request.file_path,
            request.render_command,
            request.parent_folder_path,
        );

        let input_path = self.paths.resolve_input(&job.original_path);
        let output_path = self.paths.output_for(job.id, &job.filename);
        let task = RenderTask {
            job_id: job.id,
            command: substitute_placeholders(&job.render_command, &input_path, &output_path),
            input_path,
            output_path,
            filename: job.filename.clone(),
        };

        self.store.put(&job).await;

        if let Err(e) = self.queue.enqueue(&task).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue render job");
            self.store.delete(job.id).await;
            return Err(e.into());
        }

        metrics::counter!("render_jobs_submitted_total").increment(1);
        self.events.publish(&ProgressEvent::snapshot(&job));
        tracing::info!(
            job_id = %job.id,
            filename = %job.filename,
            input = %task.input_path.display(),
            "Render job queued"
        );
        Ok(job.id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<RenderJob, RenderError> {
        self.store
            .get(job_id)
            .await
            .ok_or(RenderError::NotFound(job_id))
    }

    /// All jobs, newest first, after dropping orphans and repairing previews.
    pub async fn list_jobs(&self) -> Vec<RenderJob> {
        let persisted = self.store.list_all().await;
        let jobs = self.reconciler.sync(persisted).await;
        self.store.refresh_cache(&jobs);
        jobs
    }

    /// Delete a job and its files. Returns false only if the job does not exist.
    pub async fn delete_job(&self, job_id: Uuid) -> bool {
        let Some(job) = self.store.get(job_id).await else {
            return false;
        };

        let output_path = match job.output_path() {
            Some(path) => path.to_path_buf(),
            None => self.paths.output_for(job.id, &job.filename),
        };
        remove_artifacts(job.id, &output_path).await;

        self.store.delete(job_id).await;
        tracing::info!(job_id = %job_id, status = %job.status(), "Render job deleted");
        true
    }

    pub async fn cleanup_orphaned_jobs(&self) -> usize {
        self.reconciler.cleanup_orphaned_jobs().await
    }

    /// Register a progress listener.
    pub fn on_progress<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_input_is_joined_to_uploads() {
        let paths = RenderPaths::new("/srv/uploads", "/srv/uploads/rendered");
        assert_eq!(
            paths.resolve_input("clips/a.mp4"),
            PathBuf::from("/srv/uploads/clips/a.mp4")
        );
        assert_eq!(paths.resolve_input("/tmp/b.mp4"), PathBuf::from("/tmp/b.mp4"));
    }

    #[test]
    fn test_output_path_is_unique_per_job() {
        let paths = RenderPaths::new("/srv/uploads", "/srv/uploads/rendered");
        let a = paths.output_for(Uuid::new_v4(), "a.mp4");
        let b = paths.output_for(Uuid::new_v4(), "a.mp4");
        assert_ne!(a, b);
        assert!(a.starts_with("/srv/uploads/rendered"));
        assert!(a.to_string_lossy().ends_with("_rendered_a.mp4"));
    }

    #[test]
    fn test_output_name_drops_directories() {
        let paths = RenderPaths::new("/u", "/u/rendered");
        let id = Uuid::new_v4();
        assert_eq!(
            paths.output_for(id, "../../etc/a.mp4"),
            PathBuf::from(format!("/u/rendered/{id}_rendered_a.mp4"))
        );
        assert_eq!(
            paths.output_for(id, ".."),
            PathBuf::from(format!("/u/rendered/{id}_rendered_output"))
        );
    }
}

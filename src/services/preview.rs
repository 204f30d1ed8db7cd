use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::services::executor::{substitute_placeholders, CommandRunner, ExecutionError};

/// Extracts one frame at the 1-second mark.
pub const DEFAULT_PREVIEW_COMMAND: &str =
    "ffmpeg -i {input} -ss 00:00:01 -vframes 1 -q:v 2 -y {output}";

/// Preview file for a job, stored next to its output.
pub fn preview_path(output_path: &Path, job_id: Uuid) -> PathBuf {
    let dir = output_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(preview_file_name(job_id))
}

pub fn preview_file_name(job_id: Uuid) -> String {
    format!("{job_id}_preview.jpg")
}

/// Generates still-image previews by running the preview command template.
#[derive(Clone)]
pub struct PreviewGenerator {
    runner: Arc<dyn CommandRunner>,
    command_template: String,
}

impl PreviewGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>, command_template: impl Into<String>) -> Self {
        Self {
            runner,
            command_template: command_template.into(),
        }
    }

    /// Render a preview for `output_path`. Callers log failures; they never change job status.
    pub async fn generate(&self, job_id: Uuid, output_path: &Path) -> Result<PathBuf, PreviewError> {
        let target = preview_path(output_path, job_id);
        let command = substitute_placeholders(&self.command_template, output_path, &target);

        self.runner.run(&command).await.map_err(PreviewError::Command)?;

        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(PreviewError::Missing(target));
        }

        tracing::info!(job_id = %job_id, preview = %target.display(), "Preview generated");
        Ok(target)
    }

    /// Generate a preview only when none exists yet.
    pub async fn ensure(&self, job_id: Uuid, output_path: &Path) -> Result<bool, PreviewError> {
        let target = preview_path(output_path, job_id);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(false);
        }
        self.generate(job_id, output_path).await?;
        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("preview command failed: {0}")]
    Command(#[from] ExecutionError),

    #[error("preview command produced no file at {}", .0.display())]
    Missing(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::executor::ShellRunner;

    fn generator(template: &str) -> PreviewGenerator {
        PreviewGenerator::new(Arc::new(ShellRunner::default()), template)
    }

    #[test]
    fn test_preview_path_is_sibling_of_output() {
        let id = Uuid::new_v4();
        let path = preview_path(Path::new("/srv/rendered/out.mp4"), id);
        assert_eq!(path, PathBuf::from(format!("/srv/rendered/{id}_preview.jpg")));
    }

    #[tokio::test]
    async fn test_generate_writes_preview() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        std::fs::write(&output, b"video").unwrap();

        let id = Uuid::new_v4();
        let path = generator("cp {input} {output}")
            .generate(id, &output)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"video");
    }

    #[tokio::test]
    async fn test_generate_reports_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let err = generator("exit 1").generate(Uuid::new_v4(), &output).await.unwrap_err();
        assert!(matches!(err, PreviewError::Command(_)));
    }

    #[tokio::test]
    async fn test_generate_requires_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let err = generator("true").generate(Uuid::new_v4(), &output).await.unwrap_err();
        assert!(matches!(err, PreviewError::Missing(_)));
    }

    #[tokio::test]
    async fn test_ensure_skips_existing_preview() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let id = Uuid::new_v4();
        std::fs::write(preview_path(&output, id), b"jpg").unwrap();

        // The command would fail if it ran.
        assert!(!generator("exit 1").ensure(id, &output).await.unwrap());
    }
}

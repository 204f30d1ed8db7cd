use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Highest progress value the synthetic ticker may report before a job finishes.
pub const PROGRESS_CEILING: u8 = 90;

/// Status of a render job, as exposed to callers and persisted on the wire.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Lifecycle state of a job. Each variant carries exactly the fields that
/// are valid for it, flattened into the record's wire shape under `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum JobState {
    Pending,
    Processing {
        started_at: DateTime<Utc>,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        output_path: PathBuf,
    },
    Failed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: String,
    },
}

/// Facts about the produced artifact, recorded on completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A render job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub id: Uuid,
    pub filename: String,
    /// Source path relative to the uploads root, kept for display.
    pub original_path: String,
    #[serde(flatten)]
    pub state: JobState,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    /// Command template still holding the `{input}`/`{output}` placeholders.
    pub render_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_folder_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobMetadata>,
}

/// A single transition or progress step applied by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    StartProcessing,
    Progress(u8),
    Complete {
        output_path: PathBuf,
        metadata: Option<JobMetadata>,
    },
    Fail {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("job is already {0} and accepts no further updates")]
    Terminal(JobStatus),

    #[error("cannot apply {update} to a job that is {status}")]
    Invalid {
        status: JobStatus,
        update: &'static str,
    },
}

impl RenderJob {
    /// Create a freshly submitted job in the pending state.
    pub fn new(
        filename: impl Into<String>,
        original_path: impl Into<String>,
        render_command: impl Into<String>,
        parent_folder_path: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            original_path: original_path.into(),
            state: JobState::Pending,
            progress: 0,
            created_at: Utc::now(),
            render_command: render_command.into(),
            parent_folder_path,
            metadata: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Pending => None,
            JobState::Processing { started_at }
            | JobState::Completed { started_at, .. }
            | JobState::Failed { started_at, .. } => Some(*started_at),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Completed { completed_at, .. } | JobState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    pub fn output_path(&self) -> Option<&Path> {
        match &self.state {
            JobState::Completed { output_path, .. } => Some(output_path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Apply an update, enforcing `pending -> processing -> {completed | failed}`.
    ///
    /// Returns `Ok(false)` when the update was legal but changed nothing
    /// (a progress tick at or below the current value).
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(TransitionError::Terminal(status));
        }

        match update {
            JobUpdate::StartProcessing => {
                // Redelivered tasks find the job already processing; keep the first start time.
                if let JobState::Pending = self.state {
                    self.state = JobState::Processing { started_at: now };
                    return Ok(true);
                }
                Ok(false)
            }
            JobUpdate::Progress(value) => {
                if status != JobStatus::Processing {
                    return Err(TransitionError::Invalid {
                        status,
                        update: "progress",
                    });
                }
                let next = value.min(PROGRESS_CEILING);
                if next <= self.progress {
                    return Ok(false);
                }
                self.progress = next;
                Ok(true)
            }
            JobUpdate::Complete {
                output_path,
                metadata,
            } => {
                let started_at = self.require_started(status, "complete")?;
                self.state = JobState::Completed {
                    started_at,
                    completed_at: now.max(started_at),
                    output_path,
                };
                self.progress = 100;
                self.metadata = metadata;
                Ok(true)
            }
            JobUpdate::Fail { error } => {
                let started_at = self.require_started(status, "fail")?;
                self.state = JobState::Failed {
                    started_at,
                    completed_at: now.max(started_at),
                    error,
                };
                Ok(true)
            }
        }
    }

    fn require_started(
        &self,
        status: JobStatus,
        update: &'static str,
    ) -> Result<DateTime<Utc>, TransitionError> {
        self.started_at()
            .ok_or(TransitionError::Invalid { status, update })
    }
}

/// Stage reported alongside a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProgressStage {
    Queued,
    Processing,
    Completed,
    Failed,
    /// The record was removed by reconciliation.
    Discarded,
}

/// Advisory event broadcast whenever a job's status or progress changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub stage: ProgressStage,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn for_job(job: &RenderJob, stage: ProgressStage) -> Self {
        Self {
            job_id: job.id,
            status: job.status(),
            progress: job.progress,
            stage,
            timestamp: Utc::now(),
        }
    }

    /// Stage matching the job's current status.
    pub fn snapshot(job: &RenderJob) -> Self {
        let stage = match job.status() {
            JobStatus::Pending => ProgressStage::Queued,
            JobStatus::Processing => ProgressStage::Processing,
            JobStatus::Completed => ProgressStage::Completed,
            JobStatus::Failed => ProgressStage::Failed,
        };
        Self::for_job(job, stage)
    }
}

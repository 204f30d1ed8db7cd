use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::RenderJob;

/// Request to queue a render job.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// Display name of the source file; also names the output artifact.
    #[garde(custom(not_blank))]
    #[serde(default)]
    pub filename: String,

    /// Path of the source file, relative to the uploads root.
    #[garde(custom(not_blank))]
    #[serde(default)]
    pub file_path: String,

    /// Command template containing `{input}` and `{output}` placeholders.
    #[garde(custom(not_blank))]
    #[serde(default)]
    pub render_command: String,

    #[garde(skip)]
    #[serde(default)]
    pub parent_folder_path: Option<String>,
}

#[allow(clippy::ptr_arg)]
fn not_blank(value: &String, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        return Err(garde::Error::new("must not be empty"));
    }
    Ok(())
}

/// Response after queueing a render job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub job_id: Uuid,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job: RenderJob,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<RenderJob>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub success: bool,
    pub message: String,
    pub cleaned_count: usize,
}

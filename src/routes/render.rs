use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::RenderError;
use crate::models::render::{
    CleanupResponse, DeleteResponse, JobListResponse, JobResponse, SubmitRequest, SubmitResponse,
};
use crate::services::preview::preview_path;

/// Served when a job has no preview yet.
const PLACEHOLDER_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="320" height="180" viewBox="0 0 320 180"><rect width="320" height="180" fill="#e5e7eb"/><path d="M140 65v50l40-25z" fill="#9ca3af"/></svg>"##;

/// POST /api/render — Queue a render job.
pub async fn submit_render(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, RenderError> {
    let job_id = state.render.submit_request(request).await?;

    Ok(Json(SubmitResponse {
        success: true,
        job_id,
        message: "Render job queued successfully".to_string(),
    }))
}

/// GET /api/render — List jobs, reconciling them with the filesystem.
pub async fn list_jobs(State(state): State<AppState>) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: state.render.list_jobs().await,
    })
}

/// GET /api/render/{job_id} — Check render job status.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, RenderError> {
    let job = state.render.get_job(job_id).await?;
    Ok(Json(JobResponse { job }))
}

/// DELETE /api/render/{job_id} — Delete a job and its files.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, RenderError> {
    if !state.render.delete_job(job_id).await {
        return Err(RenderError::NotFound(job_id));
    }

    Ok(Json(DeleteResponse {
        success: true,
        message: "Job deleted successfully".to_string(),
    }))
}

/// POST /api/render/cleanup — Remove completed jobs whose output is gone.
pub async fn cleanup_jobs(State(state): State<AppState>) -> Json<CleanupResponse> {
    let cleaned_count = state.render.cleanup_orphaned_jobs().await;

    Json(CleanupResponse {
        success: true,
        message: format!("Cleaned up {cleaned_count} orphaned jobs"),
        cleaned_count,
    })
}

/// GET /api/render/{job_id}/preview — Preview image, or a placeholder.
pub async fn get_preview(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> Response {
    let output_path = match state.render.get_job(job_id).await {
        Ok(job) => job.output_path().map(|p| p.to_path_buf()),
        Err(_) => None,
    };

    let Some(output_path) = output_path else {
        return placeholder("public, max-age=60");
    };

    match tokio::fs::read(preview_path(&output_path, job_id)).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "public, max-age=3600"),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => placeholder("public, max-age=3600"),
    }
}

fn placeholder(cache_control: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/svg+xml"),
            (header::CACHE_CONTROL, cache_control),
        ],
        PLACEHOLDER_SVG,
    )
        .into_response()
}

/// GET /api/download/{job_id} — Download the rendered file.
pub async fn download_output(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, RenderError> {
    let job = state.render.get_job(job_id).await?;
    let output_path = job
        .output_path()
        .ok_or(RenderError::NotReady(job_id))?
        .to_path_buf();

    let bytes = tokio::fs::read(&output_path).await.map_err(|e| {
        tracing::warn!(job_id = %job_id, error = %e, "Rendered file unreadable");
        RenderError::NotFound(job_id)
    })?;

    let filename = output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let content_type = mime_guess::from_path(&output_path)
        .first_or_octet_stream()
        .to_string();

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

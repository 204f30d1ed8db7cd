use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use crate::services::queue::QueueError;

/// Errors surfaced to callers of the render service.
///
/// Execution, persistence and preview failures never appear here: they are
/// recorded on the job or logged.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job not ready: {0}")]
    NotReady(Uuid),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl RenderError {
    fn status_code(&self) -> StatusCode {
        match self {
            RenderError::Validation(_) | RenderError::NotReady(_) => StatusCode::BAD_REQUEST,
            RenderError::NotFound(_) => StatusCode::NOT_FOUND,
            RenderError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for RenderError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Render request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

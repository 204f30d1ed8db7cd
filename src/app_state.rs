use std::sync::Arc;

use crate::services::{queue::TaskQueue, render::RenderService, store::JobStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub render: Arc<RenderService>,
    pub store: Arc<JobStore>,
    pub queue: Arc<dyn TaskQueue>,
}

impl AppState {
    pub fn new(render: RenderService, store: Arc<JobStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            render: Arc::new(render),
            store,
            queue,
        }
    }
}

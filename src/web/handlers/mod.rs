use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use crate::AppContext;

pub mod export;
pub mod tasks;
pub mod upload;

/// Body of the batch endpoints.
#[derive(Debug, Deserialize)]
pub struct TaskIdsRequest {
    pub task_ids: Vec<String>,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // per-file size limits are enforced while streaming
        .route(
            "/upload",
            post(upload::upload_files).layer(DefaultBodyLimit::disable()),
        )
        .route("/tasks", get(tasks::list_tasks).delete(tasks::delete_tasks))
        .route("/tasks/:task_id", get(tasks::get_task))
        .route("/stats", get(tasks::get_stats))
        .route("/export", post(export::export_tasks))
        .with_state(ctx)
}

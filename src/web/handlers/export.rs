use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::info;

use super::TaskIdsRequest;
use crate::export::{export_rows, write_xlsx, EXPORT_FILENAME, XLSX_CONTENT_TYPE};
use crate::web::ApiError;
use crate::AppContext;

// POST /export
pub async fn export_tasks(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<TaskIdsRequest>,
) -> Result<Response, ApiError> {
    let tasks = ctx.task_manager.tasks_by_ids(&req.task_ids).await?;
    if tasks.is_empty() {
        return Err(ApiError::NotFound("No tasks found".to_string()));
    }

    let rows = export_rows(&tasks);
    let bytes = write_xlsx(&rows)?;
    info!("Exported {} task(s) ({} bytes)", rows.len(), bytes.len());

    let disposition = format!("attachment; filename=\"{}\"", EXPORT_FILENAME);
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::TaskIdsRequest;
use crate::schedule::scheduler::{FailedDelete, ServiceStats};
use crate::schedule::types::{Task, TaskStatus};
use crate::web::ApiError;
use crate::AppContext;

/// Client view of a task. `result` only appears for completed tasks and
/// `error` only for failed ones.
#[derive(Debug, Serialize)]
pub struct TaskView {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let completed = task.status == TaskStatus::Completed;
        let failed = task.status == TaskStatus::Failed;
        Self {
            id: task.id,
            filename: task.filename,
            status: task.status,
            created_at: task.created_at,
            completed_at: task.completed_at.filter(|_| completed),
            result: task.result.filter(|_| completed),
            error: task.error.filter(|_| failed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub queued_jobs: u64,
    pub leased_jobs: u64,
    pub dead_jobs: u64,
}

impl From<ServiceStats> for StatsResponse {
    fn from(stats: ServiceStats) -> Self {
        Self {
            pending: stats.tasks.pending,
            processing: stats.tasks.processing,
            completed: stats.tasks.completed,
            failed: stats.tasks.failed,
            queued_jobs: stats.queue.queued,
            leased_jobs: stats.queue.leased,
            dead_jobs: stats.queue.dead,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: &'static str,
    pub deleted_count: usize,
    pub failed_deletes: Vec<FailedDelete>,
}

// GET /tasks
pub async fn list_tasks(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let tasks = ctx.task_manager.list_tasks().await?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

// GET /tasks/:task_id
pub async fn get_task(
    State(ctx): State<Arc<AppContext>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    match ctx.task_manager.get_task(&task_id).await? {
        Some(task) => Ok(Json(task.into())),
        None => Err(ApiError::NotFound("Task not found".to_string())),
    }
}

// DELETE /tasks
pub async fn delete_tasks(
    State(ctx): State<Arc<AppContext>>,
    Json(req): Json<TaskIdsRequest>,
) -> Result<Json<DeleteResponse>, ApiError> {
    if req.task_ids.is_empty() {
        return Err(ApiError::BadRequest("task_ids must not be empty".to_string()));
    }
    match ctx.task_manager.delete_tasks(&req.task_ids).await? {
        Some(report) => Ok(Json(DeleteResponse {
            status: "success",
            deleted_count: report.deleted_count,
            failed_deletes: report.failed_deletes,
        })),
        None => Err(ApiError::NotFound("No tasks found".to_string())),
    }
}

// GET /stats
pub async fn get_stats(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = ctx.task_manager.get_task_stats().await?;
    Ok(Json(stats.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_hides_fields_that_do_not_match_status() {
        let mut task = Task::new("id", "a.wav");
        task.status = TaskStatus::Processing;
        task.result = Some("stale".to_string());
        task.error = Some("stale".to_string());

        let view = TaskView::from(task);
        assert!(view.result.is_none());
        assert!(view.error.is_none());
        assert!(view.completed_at.is_none());
    }

    #[test]
    fn test_view_serializes_lowercase_status() {
        let mut task = Task::new("id", "a.wav");
        task.status = TaskStatus::Failed;
        task.error = Some("audio file not found".to_string());

        let value = serde_json::to_value(TaskView::from(task)).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "audio file not found");
        assert!(value["result"].is_null());
    }
}

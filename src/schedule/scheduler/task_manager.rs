use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::schedule::queue::{JobQueue, QueueDepth, QueueError};
use crate::schedule::types::{Task, TranscribeJob, TRANSCRIBE_QUEUE};
use crate::storage::task::{StatusUpdate, StoreError, TaskStats, TaskStorage};
use crate::storage::upload::UploadDir;

/// Read and housekeeping side of the task system.
pub struct TaskManager {
    storage: Arc<dyn TaskStorage>,
    uploads: UploadDir,
    queue: Arc<JobQueue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDelete {
    pub task_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub deleted_count: usize,
    pub failed_deletes: Vec<FailedDelete>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub tasks: TaskStats,
    pub queue: QueueDepth,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("upload directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskManager {
    pub fn new(storage: Arc<dyn TaskStorage>, uploads: UploadDir, queue: Arc<JobQueue>) -> Self {
        Self {
            storage,
            uploads,
            queue,
        }
    }

    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        self.storage.list().await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.storage.get(task_id).await
    }

    /// Tasks for the given ids, newest first. Unknown ids are skipped.
    pub async fn tasks_by_ids(&self, ids: &[String]) -> Result<Vec<Task>, StoreError> {
        self.storage.list_by_ids(&dedup(ids)).await
    }

    /// Delete tasks and their uploads, each one independently.
    ///
    /// Returns `None` when none of the ids exist. Ids that are missing, or
    /// whose file or row could not be removed, end up in `failed_deletes`.
    pub async fn delete_tasks(&self, ids: &[String]) -> Result<Option<DeleteReport>, StoreError> {
        let ids = dedup(ids);
        let existing = self.storage.list_by_ids(&ids).await?;
        if existing.is_empty() {
            return Ok(None);
        }

        let mut report = DeleteReport {
            deleted_count: 0,
            failed_deletes: Vec::new(),
        };

        for id in &ids {
            let task = match existing.iter().find(|t| &t.id == id) {
                Some(task) => task,
                None => {
                    report.failed_deletes.push(FailedDelete {
                        task_id: id.clone(),
                        error: "task not found".to_string(),
                    });
                    continue;
                }
            };

            match self.delete_one(task).await {
                Ok(()) => report.deleted_count += 1,
                Err(e) => {
                    warn!("Failed to delete task {}: {}", task.id, e);
                    report.failed_deletes.push(FailedDelete {
                        task_id: task.id.clone(),
                        error: e,
                    });
                }
            }
        }

        info!(
            "Deleted {} task(s), {} failure(s)",
            report.deleted_count,
            report.failed_deletes.len()
        );
        Ok(Some(report))
    }

    /// Row first: a failed row delete leaves the task, its job and its upload
    /// untouched. A job or file left behind after the row is gone is dropped
    /// by the worker (`TaskNotFound`) or the orphan sweep.
    async fn delete_one(&self, task: &Task) -> Result<(), String> {
        match self.storage.delete(&task.id).await {
            Ok(true) => {}
            Ok(false) => return Err("task not found".to_string()),
            Err(e) => return Err(e.to_string()),
        }

        if let Err(e) = self.queue.cancel(TRANSCRIBE_QUEUE, &task.id).await {
            warn!("Failed to cancel queued job of task {}: {}", task.id, e);
        }

        let path = self.uploads.path_for(&task.id, &task.filename);
        if let Err(e) = UploadDir::remove_if_exists(&path) {
            warn!(
                "Task {} deleted but its upload {} was not removed: {}",
                task.id,
                path.display(),
                e
            );
        }
        Ok(())
    }

    pub async fn get_task_stats(&self) -> Result<ServiceStats, ManagerError> {
        Ok(ServiceStats {
            tasks: self.storage.stats().await?,
            queue: self.queue.depth(TRANSCRIBE_QUEUE).await?,
        })
    }

    /// Fail tasks whose final delivery lost its worker (crash, kill) and drop
    /// their uploads. Returns how many tasks were marked failed.
    ///
    /// The reaped jobs are already dead, so one bad write must not stop the
    /// rest of the batch.
    pub async fn handle_expired_leases(&self) -> Result<usize, ManagerError> {
        let reaped = self.queue.reap_expired(TRANSCRIBE_QUEUE).await?;
        let mut failed = 0;
        for job in &reaped {
            let payload = match job.decode::<TranscribeJob>() {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Reaped job {} has an unreadable payload: {}", job.id, e);
                    continue;
                }
            };
            warn!(
                "Task {} lost its worker on the final attempt, marking failed",
                payload.task_id
            );

            let update = StatusUpdate::Failed {
                error: "worker lost: lease expired on final attempt".to_string(),
            };
            if let Err(e) = self.storage.update_status(&payload.task_id, update).await {
                error!(
                    "Failed to mark reaped task {} as failed: {}",
                    payload.task_id, e
                );
                continue;
            }
            failed += 1;
            if let Ok(path) = self.uploads.resolve(&payload.file_name) {
                if let Err(e) = UploadDir::remove_if_exists(&path) {
                    warn!("Failed to remove upload {}: {}", path.display(), e);
                }
            }
        }
        Ok(failed)
    }

    /// Remove uploads older than `grace` that no deliverable job refers to.
    pub async fn sweep_orphans(&self, grace: Duration) -> Result<usize, ManagerError> {
        let live: HashSet<String> = self
            .queue
            .live_payloads(TRANSCRIBE_QUEUE)
            .await?
            .iter()
            .filter_map(|p| serde_json::from_str::<TranscribeJob>(p).ok())
            .map(|job| job.file_name)
            .collect();

        let now = SystemTime::now();
        let mut removed = 0;
        for file in self.uploads.list().await? {
            if live.contains(&file.name) {
                continue;
            }
            let age = now.duration_since(file.modified).unwrap_or_default();
            if age < grace {
                continue;
            }
            match UploadDir::remove_if_exists(&file.path) {
                Ok(true) => {
                    info!("Removed orphaned upload {}", file.name);
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove orphaned upload {}: {}", file.name, e),
            }
        }
        Ok(removed)
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedup(&ids), vec!["b".to_string(), "a".to_string()]);
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::schedule::types::{Task, TaskStatus};

pub mod entity;
pub mod mapping;
pub mod sqlite;

pub use sqlite::SqliteTaskStorage;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task already exists: {0}")]
    DuplicateId(String),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

/// A lifecycle transition written by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Processing,
    Completed { result: String },
    Failed { error: String },
}

impl StatusUpdate {
    pub fn status(&self) -> TaskStatus {
        match self {
            StatusUpdate::Processing => TaskStatus::Processing,
            StatusUpdate::Completed { .. } => TaskStatus::Completed,
            StatusUpdate::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The row is gone, usually deleted by a client while the job ran.
    NotFound,
    /// The row exists but its current state does not allow the transition.
    Rejected(TaskStatus),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    /// Insert a new `pending` task.
    async fn create(&self, id: &str, filename: &str) -> Result<Task, StoreError>;
    async fn get(&self, id: &str) -> Result<Option<Task>, StoreError>;
    /// All tasks, newest first.
    async fn list(&self) -> Result<Vec<Task>, StoreError>;
    async fn list_by_ids(&self, ids: &[String]) -> Result<Vec<Task>, StoreError>;
    /// Partial update of one row. Never fails because the row is missing.
    async fn update_status(&self, id: &str, update: StatusUpdate) -> Result<UpdateOutcome, StoreError>;
    /// Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
    async fn stats(&self) -> Result<TaskStats, StoreError>;
}

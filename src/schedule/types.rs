use std::fmt::Display;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Name of the queue channel carrying transcription jobs.
pub const TRANSCRIBE_QUEUE: &str = "transcribe";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// States a row may be in for an update to `self` to apply.
    ///
    /// `completed` is terminal and `pending` is only ever written at creation.
    /// `failed` may go back to `processing` when the queue redelivers the job.
    pub fn predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[],
            TaskStatus::Processing => &[TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Failed],
            TaskStatus::Completed => &[TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Failed],
            TaskStatus::Failed => &[TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Failed],
        }
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;
    fn try_from(status: &str) -> Result<Self, Self::Error> {
        match status {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Invalid task status: {}", status)),
        }
    }
}

/// One submitted file and the outcome of its transcription.
///
/// Timestamps are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Name of the uploaded file inside the upload directory.
    pub fn storage_name(&self) -> String {
        crate::storage::upload::storage_name(&self.id, &self.filename)
    }
}

/// Queue payload for a transcription job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribeJob {
    pub task_id: String,
    pub file_name: String,
}

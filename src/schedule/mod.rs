pub mod gateway;
pub mod processors;
pub mod queue;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod tests;

// 重导出主要类型
pub use types::{Task, TaskStatus, TranscribeJob, TRANSCRIBE_QUEUE};

pub use crate::storage::task::TaskStorage;

pub use gateway::{PendingUpload, SubmissionGateway, SubmitError, SubmittedFile};
pub use processors::{JobError, TaskProcessor, TranscribeProcessor};
pub use queue::{Job, JobQueue, NackOutcome, QueueError, RetryPolicy};
pub use scheduler::{DeleteReport, SchedulerConfig, ServiceStats, TaskManager, TaskScheduler, TaskWorker};

pub mod transcribe;

use std::time::Duration;

use async_trait::async_trait;

use crate::schedule::queue::Job;
use crate::storage::task::StoreError;
use crate::storage::upload::UnsafeFileName;

pub use transcribe::{JobGuard, TranscribeProcessor};

/// Why a delivery failed. The variant decides whether the queue retries it.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    UnsafeFileName(#[from] UnsafeFileName),
    #[error("audio file not found: {0}")]
    FileNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("time limit of {0:?} exceeded")]
    TimedOut(Duration),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    /// Broken messages and vanished tasks will never succeed on redelivery.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::InvalidPayload(_) | JobError::UnsafeFileName(_) | JobError::TaskNotFound(_)
        )
    }
}

#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    /// Queue channel this processor consumes.
    fn queue(&self) -> &'static str;

    /// Handle one delivery. Must leave no upload behind, whatever the outcome.
    async fn process(&self, job: &Job) -> Result<(), JobError>;

    /// Record a failure the handler could not record itself, because it was
    /// cut off at the time limit or panicked.
    async fn abandon(&self, job: &Job, error: &JobError) -> Result<(), JobError>;
}

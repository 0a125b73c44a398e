use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{JobError, TaskProcessor};
use crate::asr::{AsrEngine, AsrParams};
use crate::schedule::queue::Job;
use crate::schedule::types::{TranscribeJob, TRANSCRIBE_QUEUE};
use crate::storage::task::{StatusUpdate, TaskStorage, UpdateOutcome};
use crate::storage::upload::UploadDir;
use crate::utils::retry::retry_async;

const FINAL_WRITE_ATTEMPTS: usize = 3;
const FINAL_WRITE_BASE_DELAY: Duration = Duration::from_millis(200);

/// Deletes a job's upload when dropped.
///
/// Dropping happens on every exit from the handler, including errors, panics
/// and the future being cancelled at the time limit.
pub struct JobGuard {
    path: PathBuf,
}

impl JobGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        match UploadDir::remove_if_exists(&self.path) {
            Ok(true) => info!("Removed upload {}", self.path.display()),
            Ok(false) => debug!("Upload {} already gone", self.path.display()),
            Err(e) => warn!("Failed to remove upload {}: {}", self.path.display(), e),
        }
    }
}

pub struct TranscribeProcessor {
    asr: Arc<dyn AsrEngine>,
    storage: Arc<dyn TaskStorage>,
    uploads: UploadDir,
    params: AsrParams,
}

impl TranscribeProcessor {
    pub fn new(
        asr: Arc<dyn AsrEngine>,
        storage: Arc<dyn TaskStorage>,
        uploads: UploadDir,
        params: AsrParams,
    ) -> Self {
        Self {
            asr,
            storage,
            uploads,
            params,
        }
    }

    fn decode(job: &Job) -> Result<TranscribeJob, JobError> {
        job.decode::<TranscribeJob>()
            .map_err(|e| JobError::InvalidPayload(e.to_string()))
    }

    /// Mark the task failed and hand the error back for retry accounting.
    ///
    /// A task that no longer exists becomes `TaskNotFound`. A task another
    /// delivery already completed swallows the error, so the job is acked.
    async fn record_failure(&self, task_id: &str, err: JobError) -> Result<(), JobError> {
        let update = StatusUpdate::Failed {
            error: err.to_string(),
        };
        match self.storage.update_status(task_id, update).await {
            Ok(UpdateOutcome::Updated) => Err(err),
            Ok(UpdateOutcome::NotFound) => Err(JobError::TaskNotFound(task_id.to_string())),
            Ok(UpdateOutcome::Rejected(status)) => {
                info!(
                    "Task {} is already {}, dropping duplicate delivery ({})",
                    task_id, status, err
                );
                Ok(())
            }
            Err(store_err) => {
                error!("Failed to record failure of task {}: {}", task_id, store_err);
                Err(err)
            }
        }
    }

    async fn run_asr(&self, path: &Path) -> Result<String, JobError> {
        let asr = self.asr.clone();
        let params = self.params.clone();
        let audio_path = path.to_path_buf();

        let outcome =
            tokio::task::spawn_blocking(move || asr.transcribe_file(&audio_path, &params)).await;
        match outcome {
            Ok(Ok(result)) => {
                info!(
                    "Transcribed {} ({} segments, {} chars)",
                    path.display(),
                    result.segments.len(),
                    result.full_text.chars().count()
                );
                Ok(result.full_text)
            }
            Ok(Err(e)) => Err(JobError::Transcription(format!("{:#}", e))),
            Err(join_err) => Err(JobError::Transcription(format!(
                "recognizer thread failed: {}",
                join_err
            ))),
        }
    }
}

#[async_trait]
impl TaskProcessor for TranscribeProcessor {
    fn queue(&self) -> &'static str {
        TRANSCRIBE_QUEUE
    }

    async fn process(&self, job: &Job) -> Result<(), JobError> {
        let payload = Self::decode(job)?;
        let path = self.uploads.resolve(&payload.file_name)?;
        let _guard = JobGuard::new(path.clone());
        let task_id = payload.task_id.as_str();

        info!(
            "Processing transcribe task {} (attempt {}/{})",
            task_id,
            job.attempts,
            job.max_retries + 1
        );

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let err = JobError::FileNotFound(payload.file_name.clone());
            return self.record_failure(task_id, err).await;
        }

        match self.storage.update_status(task_id, StatusUpdate::Processing).await? {
            UpdateOutcome::Updated => {}
            UpdateOutcome::NotFound => return Err(JobError::TaskNotFound(task_id.to_string())),
            UpdateOutcome::Rejected(status) => {
                info!("Task {} is already {}, dropping duplicate delivery", task_id, status);
                return Ok(());
            }
        }

        let text = match self.run_asr(&path).await {
            Ok(text) => text,
            Err(err) => {
                warn!("Task {} failed: {}", task_id, err);
                return self.record_failure(task_id, err).await;
            }
        };

        let outcome = retry_async(
            || {
                self.storage.update_status(
                    task_id,
                    StatusUpdate::Completed {
                        result: text.clone(),
                    },
                )
            },
            FINAL_WRITE_ATTEMPTS,
            FINAL_WRITE_BASE_DELAY,
            2,
        )
        .await?;

        match outcome {
            UpdateOutcome::Updated => {
                info!("Task {} completed", task_id);
                Ok(())
            }
            UpdateOutcome::NotFound => Err(JobError::TaskNotFound(task_id.to_string())),
            UpdateOutcome::Rejected(status) => {
                warn!("Task {} was {} before the result landed", task_id, status);
                Ok(())
            }
        }
    }

    async fn abandon(&self, job: &Job, error: &JobError) -> Result<(), JobError> {
        let payload = Self::decode(job)?;
        if let Ok(path) = self.uploads.resolve(&payload.file_name) {
            drop(JobGuard::new(path));
        }

        let update = StatusUpdate::Failed {
            error: error.to_string(),
        };
        match self.storage.update_status(&payload.task_id, update).await? {
            UpdateOutcome::NotFound => Err(JobError::TaskNotFound(payload.task_id)),
            _ => Ok(()),
        }
    }
}

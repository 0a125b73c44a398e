//! Intake of uploaded audio: validation, durable storage, task row, job.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use mime::Mime;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::schedule::queue::{JobQueue, QueueError};
use crate::schedule::types::{TaskStatus, TranscribeJob, TRANSCRIBE_QUEUE};
use crate::storage::task::{StoreError, TaskStorage};
use crate::storage::upload::{sanitize_filename, storage_name, UploadDir};

/// Media types accepted for transcription.
pub static ALLOWED_MEDIA_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "audio/mpeg",
        "audio/mp3",
        "audio/wav",
        "audio/x-wav",
        "audio/ogg",
        "audio/x-m4a",
        "audio/m4a",
        "video/mp4",
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unsupported type: {content_type}. supported types: {allowed}")]
    UnsupportedType { content_type: String, allowed: String },
    #[error("file too large. maximum allowed size is {limit_mb}MB")]
    TooLarge { limit_mb: u64 },
    #[error("failed to save file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create task: {0}")]
    Store(#[from] StoreError),
    #[error("failed to enqueue task: {0}")]
    Queue(#[from] QueueError),
}

impl SubmitError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubmitError::UnsupportedType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            SubmitError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            SubmitError::Io(_) | SubmitError::Store(_) | SubmitError::Queue(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedFile {
    pub filename: String,
    pub task_id: String,
    pub status: TaskStatus,
}

/// Essence of a Content-Type header: `Audio/WAV; codecs=1` -> `audio/wav`.
/// `None` when the header is not a media type at all.
pub fn normalize_media_type(content_type: &str) -> Option<String> {
    content_type
        .trim()
        .parse::<Mime>()
        .ok()
        .map(|mime| mime.essence_str().to_ascii_lowercase())
}

pub fn validate_media_type(content_type: Option<&str>) -> Result<(), SubmitError> {
    let normalized = content_type.and_then(normalize_media_type).unwrap_or_default();
    if ALLOWED_MEDIA_TYPES.contains(normalized.as_str()) {
        return Ok(());
    }

    let mut allowed: Vec<&str> = ALLOWED_MEDIA_TYPES.iter().copied().collect();
    allowed.sort_unstable();
    Err(SubmitError::UnsupportedType {
        content_type: content_type.unwrap_or("unknown").to_string(),
        allowed: allowed.join(", "),
    })
}

/// An upload being streamed to disk.
///
/// The partial file is removed on drop unless the upload was committed.
pub struct PendingUpload {
    task_id: String,
    original_filename: String,
    sanitized: String,
    path: PathBuf,
    file: Option<File>,
    written: u64,
    limit: u64,
    committed: bool,
}

impl PendingUpload {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SubmitError> {
        let next = self.written + chunk.len() as u64;
        if next > self.limit {
            return Err(SubmitError::TooLarge {
                limit_mb: self.limit / (1024 * 1024),
            });
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("upload already closed"))?;
        file.write_all(chunk).await?;
        self.written = next;
        Ok(())
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        drop(self.file.take());
        match UploadDir::remove_if_exists(&self.path) {
            Ok(true) => debug!("Removed partial upload {}", self.path.display()),
            Ok(false) => {}
            Err(e) => warn!("Failed to remove partial upload {}: {}", self.path.display(), e),
        }
    }
}

pub struct SubmissionGateway {
    storage: Arc<dyn TaskStorage>,
    uploads: UploadDir,
    queue: Arc<JobQueue>,
    max_upload_bytes: u64,
}

impl SubmissionGateway {
    pub fn new(
        storage: Arc<dyn TaskStorage>,
        uploads: UploadDir,
        queue: Arc<JobQueue>,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            storage,
            uploads,
            queue,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Validate the media type and open the destination file.
    pub async fn begin(
        &self,
        original_filename: &str,
        content_type: Option<&str>,
    ) -> Result<PendingUpload, SubmitError> {
        validate_media_type(content_type)?;

        let task_id = Uuid::new_v4().to_string();
        let sanitized = sanitize_filename(original_filename);
        let path = self.uploads.path_for(&task_id, &sanitized);
        let file = File::create(&path).await?;

        Ok(PendingUpload {
            task_id,
            original_filename: original_filename.to_string(),
            sanitized,
            path,
            file: Some(file),
            written: 0,
            limit: self.max_upload_bytes,
            committed: false,
        })
    }

    /// Persist the file, then create the task row, then enqueue the job.
    ///
    /// Any failure undoes the earlier steps, so a task row only exists for a
    /// job that was enqueued.
    pub async fn commit(&self, mut upload: PendingUpload) -> Result<SubmittedFile, SubmitError> {
        if let Some(mut file) = upload.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let task = self.storage.create(&upload.task_id, &upload.sanitized).await?;

        let job = TranscribeJob {
            task_id: task.id.clone(),
            file_name: storage_name(&task.id, &task.filename),
        };
        if let Err(e) = self
            .queue
            .enqueue(TRANSCRIBE_QUEUE, Some(&task.id), &job)
            .await
        {
            error!("Failed to enqueue task {}: {}", task.id, e);
            if let Err(de) = self.storage.delete(&task.id).await {
                error!("Failed to roll back task {}: {}", task.id, de);
            }
            return Err(e.into());
        }

        upload.committed = true;
        info!(
            "Accepted {} as task {} ({} bytes)",
            upload.original_filename, task.id, upload.written
        );
        Ok(SubmittedFile {
            filename: upload.original_filename.clone(),
            task_id: task.id,
            status: task.status,
        })
    }

    /// Submit a file already held in memory.
    pub async fn submit_bytes(
        &self,
        original_filename: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<SubmittedFile, SubmitError> {
        let mut upload = self.begin(original_filename, content_type).await?;
        upload.write_chunk(bytes).await?;
        self.commit(upload).await
    }
}

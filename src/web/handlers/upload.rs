use std::sync::Arc;

use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use crate::schedule::gateway::{SubmissionGateway, SubmitError, SubmittedFile};
use crate::web::ApiError;
use crate::AppContext;

#[derive(Debug, Serialize)]
pub struct UploadFailure {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct UploadResponse {
    pub success: Vec<SubmittedFile>,
    pub failed: Vec<UploadFailure>,
}

// POST /upload
//
// Every file part is handled on its own; one bad file does not stop the batch.
pub async fn upload_files(
    State(ctx): State<Arc<AppContext>>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut response = UploadResponse::default();
    let mut first_failure: Option<StatusCode> = None;
    let mut seen_files = 0usize;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if seen_files == 0 => {
                return Err(ApiError::BadRequest(format!("invalid multipart body: {}", e)));
            }
            Err(e) => {
                warn!("Multipart body broke off after {} file(s): {}", seen_files, e);
                response.failed.push(UploadFailure {
                    filename: String::new(),
                    error: format!("invalid multipart body: {}", e),
                });
                first_failure.get_or_insert(StatusCode::BAD_REQUEST);
                break;
            }
        };

        let filename = match field.file_name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        seen_files += 1;

        match receive_file(&ctx.gateway, &filename, field).await {
            Ok(submitted) => response.success.push(submitted),
            Err(e) => {
                warn!("Rejected upload {}: {}", filename, e);
                first_failure.get_or_insert(e.status_code());
                response.failed.push(UploadFailure {
                    filename,
                    error: e.to_string(),
                });
            }
        }
    }

    if seen_files == 0 {
        return Err(ApiError::BadRequest("no files uploaded".to_string()));
    }

    info!(
        "Upload batch: {} accepted, {} rejected",
        response.success.len(),
        response.failed.len()
    );
    let status = if response.success.is_empty() {
        first_failure.unwrap_or(StatusCode::BAD_REQUEST)
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)).into_response())
}

/// Stream one part to disk chunk by chunk, then hand it to the gateway.
async fn receive_file(
    gateway: &SubmissionGateway,
    filename: &str,
    mut field: Field<'_>,
) -> Result<SubmittedFile, SubmitError> {
    let content_type = field.content_type().map(str::to_string);
    let mut upload = gateway.begin(filename, content_type.as_deref()).await?;

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => upload.write_chunk(&chunk).await?,
            Ok(None) => break,
            Err(e) => {
                return Err(SubmitError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    e.to_string(),
                )))
            }
        }
    }

    gateway.commit(upload).await
}

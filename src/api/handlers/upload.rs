use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::request_id::RequestId;
use crate::services::staging::{StagingError, UploadedFile};
use axum::{
    Extension, Json,
    extract::{Multipart, State, multipart::MultipartError},
};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;
use validator::Validate;

use super::types::*;

/// Single-file field name
pub const FILE_FIELD: &str = "pdfFile";
/// Multi-file field name
pub const FILES_FIELD: &str = "pdfFiles";
pub const QUESTION_FIELD: &str = "question";
pub const MAX_FILES_PER_REQUEST: usize = 10;

pub const NO_FILE_MESSAGE: &str = "No file uploaded";
pub const PROCESSED_MESSAGE: &str = "Files uploaded and processed successfully";
pub const SKIPPED_MESSAGE: &str = "Files uploaded successfully, but processing was skipped";

fn multipart_error(e: MultipartError) -> AppError {
    let err_msg = e.to_string();
    if err_msg.contains("length limit exceeded") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(err_msg)
    }
}

// Body limit violations surface as I/O errors while a part is streamed
fn staging_error(e: StagingError) -> AppError {
    match e {
        StagingError::Io(io) if io.to_string().contains("length limit exceeded") => {
            AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
        }
        other => AppError::Staging(other),
    }
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Files stored; `data` present when processing ran", body = UploadEnvelope),
        (status = 400, description = "No file, non-PDF file or invalid question", body = ErrorResponse),
        (status = 413, description = "Upload too large", body = ErrorResponse),
        (status = 500, description = "Storage, extraction, simulation or result failure", body = ErrorResponse)
    ),
    tag = "upload"
)]
pub async fn upload_pdfs(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    mut multipart: Multipart,
) -> Result<Json<UploadEnvelope>, AppError> {
    let mut files: Vec<UploadedFile> = Vec::new();
    let mut question = String::new();

    // Capture errors so the remaining multipart stream can be consumed
    let intake: Result<(), AppError> = async {
        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();

            match name.as_str() {
                FILE_FIELD | FILES_FIELD => {
                    // Browsers send an empty part when no file was picked
                    let Some(original_name) = field
                        .file_name()
                        .filter(|n| !n.is_empty())
                        .map(str::to_string)
                    else {
                        continue;
                    };

                    if files.len() >= MAX_FILES_PER_REQUEST {
                        return Err(AppError::BadRequest(format!(
                            "At most {} files can be uploaded at once",
                            MAX_FILES_PER_REQUEST
                        )));
                    }

                    let content_type = field.content_type().map(str::to_string);
                    let body_with_io_error = field.map_err(std::io::Error::other);
                    let reader = StreamReader::new(body_with_io_error);

                    let staged = state
                        .staging
                        .stage(&name, &original_name, content_type.as_deref(), reader)
                        .await
                        .map_err(staging_error)?;
                    files.push(staged);
                }
                QUESTION_FIELD => {
                    question = field.text().await.map_err(multipart_error)?;
                }
                other => {
                    tracing::debug!("Ignoring unexpected form field '{}'", other);
                }
            }
        }

        let input = QuestionInput {
            question: question.trim().to_string(),
        };
        input.validate().map_err(|_| {
            AppError::BadRequest("Question must be at most 2000 characters".to_string())
        })?;
        question = input.question;

        if files.is_empty() {
            return Err(AppError::BadRequest(NO_FILE_MESSAGE.to_string()));
        }
        Ok(())
    }
    .await;

    if let Err(e) = intake {
        tracing::warn!(
            request_id = %request_id,
            "Upload rejected: {}. Consuming remaining stream...",
            e
        );
        state.staging.discard(&files).await;
        while let Ok(Some(mut field)) = multipart.next_field().await {
            while let Ok(Some(_)) = field.chunk().await {}
        }
        return Err(e);
    }

    tracing::info!(
        request_id = %request_id,
        "📨 Received {} PDF(s), question: {:?}",
        files.len(),
        question
    );

    let outcome = state.pipeline.run(&request_id, &files, &question).await;

    if !state.config.keep_job_dirs {
        state.staging.discard(&files).await;
    }

    let outcome = outcome?;
    let message = if outcome.analysis.is_some() {
        PROCESSED_MESSAGE
    } else {
        SKIPPED_MESSAGE
    };

    Ok(Json(UploadEnvelope {
        message: message.to_string(),
        request_id,
        files: outcome.uploads.into_iter().map(FileSummary::from).collect(),
        data: outcome.analysis,
        warnings: outcome.warnings,
    }))
}

use crate::services::analysis::AnalysisResult;
use crate::services::pipeline::StoredUpload;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Multipart form accepted by `POST /upload` (documentation only)
#[derive(Deserialize, ToSchema)]
pub struct UploadForm {
    /// A PDF part, repeatable; `pdfFiles` is accepted as well
    #[serde(rename = "pdfFile")]
    #[schema(value_type = String, format = Binary)]
    pub pdf_file: Vec<u8>,
    /// Free-text question passed to the simulator
    pub question: Option<String>,
}

#[derive(Deserialize, Validate)]
pub struct QuestionInput {
    #[validate(length(max = 2000, message = "Question must be at most 2000 characters"))]
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub original_name: String,
    pub stored_name: String,
    /// Object key inside the bucket
    #[serde(rename = "supabasePath")]
    pub storage_path: String,
    pub public_url: String,
}

impl From<StoredUpload> for FileSummary {
    fn from(upload: StoredUpload) -> Self {
        Self {
            original_name: upload.original_name,
            stored_name: upload.object.name,
            storage_path: upload.object.storage_path,
            public_url: upload.object.public_url,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadEnvelope {
    pub message: String,
    pub request_id: String,
    pub files: Vec<FileSummary>,
    /// Absent when processing was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<AnalysisResult>,
    /// Partial failures that did not stop the request
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

use crate::utils::validation::{extension_of, is_pdf_content_type, looks_like_pdf, sanitize_filename};
use rand::Rng;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const HEADER_LEN: usize = 1024;

/// A PDF part accepted from the multipart body and written to the staging area
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub original_name: String,
    pub stored_name: String,
    pub staging_path: PathBuf,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Only PDF files are allowed")]
    NotPdf { declared: Option<String> },

    #[error("File '{0}' is not a valid PDF document")]
    InvalidContent(String),

    #[error("File '{0}' is empty")]
    Empty(String),

    #[error("File '{name}' exceeds the maximum allowed size of {limit} bytes")]
    TooLarge { name: String, limit: usize },

    #[error("Failed to stage upload: {0}")]
    Io(#[from] std::io::Error),
}

/// `<field>-<unix millis>-<random>.<ext>`, the extension taken from the
/// original name and defaulting to `pdf`
pub fn generate_stored_name(field_name: &str, original_name: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000_000);
    let ext = extension_of(original_name).unwrap_or_else(|| "pdf".to_string());
    format!("{}-{}-{}.{}", field_name, timestamp, suffix, ext)
}

/// Local directory holding incoming uploads until they reach the bucket
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    max_file_size: usize,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: usize) -> Self {
        Self {
            dir: dir.into(),
            max_file_size,
        }
    }

    /// Validate one part and persist it under a generated name.
    ///
    /// The declared content type must be `application/pdf` and the first
    /// bytes must be a PDF signature. Nothing is written for rejected parts.
    pub async fn stage<R>(
        &self,
        field_name: &str,
        original_name: &str,
        content_type: Option<&str>,
        mut reader: R,
    ) -> Result<UploadedFile, StagingError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !is_pdf_content_type(content_type) {
            return Err(StagingError::NotPdf {
                declared: content_type.map(str::to_string),
            });
        }

        let original_name =
            sanitize_filename(original_name).unwrap_or_else(|| "document.pdf".to_string());

        // Multipart chunks can be tiny, fill the header buffer before sniffing
        let mut header = vec![0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        header.truncate(filled);

        if header.is_empty() {
            return Err(StagingError::Empty(original_name));
        }
        if !looks_like_pdf(&header) {
            return Err(StagingError::InvalidContent(original_name));
        }
        if header.len() > self.max_file_size {
            return Err(StagingError::TooLarge {
                name: original_name,
                limit: self.max_file_size,
            });
        }

        tokio::fs::create_dir_all(&self.dir).await?;

        let stored_name = generate_stored_name(field_name, &original_name);
        let staging_path = self.dir.join(&stored_name);

        // One byte past the limit is enough to detect an oversized part
        let remaining = (self.max_file_size - header.len()) as u64 + 1;
        let written = async {
            let mut file = tokio::fs::File::create(&staging_path).await?;
            file.write_all(&header).await?;
            let copied = tokio::io::copy(&mut (&mut reader).take(remaining), &mut file).await?;
            file.flush().await?;
            Ok::<u64, std::io::Error>(copied)
        }
        .await;

        let copied = match written {
            Ok(copied) => copied,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging_path).await;
                return Err(StagingError::Io(e));
            }
        };

        let size_bytes = header.len() as u64 + copied;
        if size_bytes > self.max_file_size as u64 {
            let _ = tokio::fs::remove_file(&staging_path).await;
            return Err(StagingError::TooLarge {
                name: original_name,
                limit: self.max_file_size,
            });
        }

        tracing::info!(
            "📎 Staged {} as {} ({} bytes)",
            original_name,
            stored_name,
            size_bytes
        );

        Ok(UploadedFile {
            field_name: field_name.to_string(),
            original_name,
            stored_name,
            staging_path,
            mime_type: mime::APPLICATION_PDF.essence_str().to_string(),
            size_bytes,
        })
    }

    /// Remove staged copies once the request is finished with them
    pub async fn discard(&self, files: &[UploadedFile]) {
        for file in files {
            if let Err(e) = tokio::fs::remove_file(&file.staging_path).await {
                tracing::warn!(
                    "Failed to remove staged file {}: {}",
                    file.staging_path.display(),
                    e
                );
            }
        }
    }
}

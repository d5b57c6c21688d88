use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const INPUTS_DIR: &str = "inputs";
const OUTPUT_DIR: &str = "output";
const MAX_REQUEST_ID_LEN: usize = 64;

/// Request ids become directory names, so only a conservative alphabet is accepted
pub fn is_safe_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Request-scoped working directory shared with the external tools.
///
/// Layout: `<work_dir>/<job_id>/` is the tools' working directory and
/// where their artifacts are read from, `inputs/` receives the bucket
/// contents and `output/` is handed to the extractor. The job id is the
/// request id plus a server-generated suffix, so a reused client id never
/// lands in an existing directory.
#[derive(Debug)]
pub struct JobWorkspace {
    request_id: String,
    job_id: String,
    root: PathBuf,
    keep: bool,
}

impl JobWorkspace {
    /// Creates a fresh workspace for one run of the pipeline
    pub async fn create(work_dir: &Path, request_id: &str, keep: bool) -> io::Result<Self> {
        if !is_safe_request_id(request_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsafe request id '{}'", request_id),
            ));
        }

        tokio::fs::create_dir_all(work_dir).await?;
        let job_id = format!("{}-{}", request_id, Uuid::new_v4().simple());
        let root = work_dir.join(&job_id);
        tokio::fs::create_dir(&root).await?;
        tokio::fs::create_dir(root.join(INPUTS_DIR)).await?;
        tokio::fs::create_dir(root.join(OUTPUT_DIR)).await?;

        // Tools run with this as their cwd; keep the path valid after a chdir
        let root = tokio::fs::canonicalize(&root).await?;

        Ok(Self {
            request_id: request_id.to_string(),
            job_id,
            root,
            keep,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Directory name of this workspace under the work dir
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUTS_DIR)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub async fn write_input(&self, file_name: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.input_dir().join(file_name);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Names of the files currently materialized in `inputs/`
    pub async fn input_files(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(self.input_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn cleanup(self) {
        if self.keep {
            tracing::debug!("Keeping job workspace {}", self.root.display());
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            tracing::warn!(
                "Failed to remove job workspace {}: {}",
                self.root.display(),
                e
            );
        }
    }
}

use crate::config::AppConfig;
use crate::services::analysis::{AnalysisResult, ArtifactError, ArtifactNames, collect_result};
use crate::services::staging::UploadedFile;
use crate::services::storage::{StorageService, StoredObject};
use crate::services::tools::{AnalysisTool, ToolError};
use crate::services::workspace::JobWorkspace;
use crate::utils::validation::sanitize_filename;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub keep_job_dirs: bool,
    pub max_concurrent_jobs: usize,
    pub artifacts: ArtifactNames,
}

impl From<&AppConfig> for PipelineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            keep_job_dirs: config.keep_job_dirs,
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            artifacts: ArtifactNames {
                comprehensive: config.comprehensive_artifact.clone(),
                metrics: config.metrics_artifact.clone(),
            },
        }
    }
}

/// One request file after it reached the bucket
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub original_name: String,
    pub object: StoredObject,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub uploads: Vec<StoredUpload>,
    /// `None` when processing was skipped after a listing failure
    pub analysis: Option<AnalysisResult>,
    pub warnings: Vec<String>,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to store {file}: {source:#}")]
    Storage {
        file: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to prepare job workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("processing queue is closed")]
    Unavailable,

    #[error("extraction failed: {0}")]
    Extraction(#[source] ToolError),

    #[error("simulation failed: {0}")]
    Simulation(#[source] ToolError),

    #[error("result collection failed: {0}")]
    Artifact(#[from] ArtifactError),
}

impl PipelineError {
    /// Message safe to return to clients: no paths, stderr or credentials
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Storage { file, .. } => {
                format!("Failed to upload {} to storage", file)
            }
            PipelineError::Workspace(_) => "Failed to prepare the processing workspace".to_string(),
            PipelineError::Unavailable => "Processing is currently unavailable".to_string(),
            PipelineError::Extraction(ToolError::TimedOut { .. }) => {
                "PDF extraction timed out".to_string()
            }
            PipelineError::Extraction(_) => "PDF extraction failed".to_string(),
            PipelineError::Simulation(ToolError::TimedOut { .. }) => {
                "Simulation timed out".to_string()
            }
            PipelineError::Simulation(_) => "Simulation failed".to_string(),
            PipelineError::Artifact(_) => "The analysis did not produce a result".to_string(),
        }
    }
}

/// Uploads request files, syncs the whole bucket into a request-scoped
/// workspace, runs extraction then simulation, and collects the result.
pub struct PipelineService {
    storage: Arc<dyn StorageService>,
    extractor: Arc<dyn AnalysisTool>,
    simulator: Arc<dyn AnalysisTool>,
    settings: PipelineSettings,
    permits: Arc<Semaphore>,
    active_jobs: Arc<AtomicUsize>,
}

/// Counts a job as active for as long as it is alive
struct ActiveJob(Arc<AtomicUsize>);

impl ActiveJob {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PipelineService {
    pub fn new(
        storage: Arc<dyn StorageService>,
        extractor: Arc<dyn AnalysisTool>,
        simulator: Arc<dyn AnalysisTool>,
        settings: PipelineSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            storage,
            extractor,
            simulator,
            settings,
            permits,
            active_jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageService> {
        &self.storage
    }

    /// Jobs currently holding a processing slot
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    pub async fn run(
        &self,
        request_id: &str,
        files: &[UploadedFile],
        question: &str,
    ) -> Result<PipelineOutcome, PipelineError> {
        let uploads = self.persist(request_id, files).await?;

        let keys = match self.storage.list().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    "⚠️  Bucket listing failed, skipping processing: {:#}", e
                );
                return Ok(PipelineOutcome {
                    uploads,
                    analysis: None,
                    warnings: vec![
                        "Stored files could not be listed, so processing was skipped".to_string(),
                    ],
                });
            }
        };

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Unavailable)?;
        let _active = ActiveJob::start(&self.active_jobs);

        let job = JobWorkspace::create(
            &self.settings.work_dir,
            request_id,
            self.settings.keep_job_dirs,
        )
        .await
        .map_err(PipelineError::Workspace)?;
        info!(
            request_id = %request_id,
            "🗂️  Job workspace {} ({} objects listed)",
            job.job_id(),
            keys.len()
        );

        let mut warnings = Vec::new();
        let result = self.process(&job, &keys, question, &mut warnings).await;
        job.cleanup().await;

        Ok(PipelineOutcome {
            uploads,
            analysis: Some(result?),
            warnings,
        })
    }

    /// All-or-nothing: the first failed `put` aborts the request
    async fn persist(
        &self,
        request_id: &str,
        files: &[UploadedFile],
    ) -> Result<Vec<StoredUpload>, PipelineError> {
        let mut uploads = Vec::with_capacity(files.len());

        for file in files {
            let storage_error = |source: anyhow::Error| PipelineError::Storage {
                file: file.original_name.clone(),
                source,
            };

            let data = tokio::fs::read(&file.staging_path)
                .await
                .map_err(|e| storage_error(e.into()))?;
            let object = self
                .storage
                .put(&file.stored_name, Bytes::from(data), &file.mime_type)
                .await
                .map_err(storage_error)?;

            info!(
                request_id = %request_id,
                "☁️  Stored {} ({} bytes, field '{}') as {}",
                file.original_name,
                file.size_bytes,
                file.field_name,
                object.storage_path
            );
            uploads.push(StoredUpload {
                original_name: file.original_name.clone(),
                object,
            });
        }

        Ok(uploads)
    }

    async fn process(
        &self,
        job: &JobWorkspace,
        keys: &[String],
        question: &str,
        warnings: &mut Vec<String>,
    ) -> Result<AnalysisResult, PipelineError> {
        let materialized = self.materialize(job, keys, warnings).await;
        info!(
            request_id = %job.request_id(),
            "📥 Materialized {} of {} bucket objects",
            materialized,
            keys.len()
        );

        self.extractor
            .run(job, &[])
            .await
            .map_err(PipelineError::Extraction)?;

        let args = if question.trim().is_empty() {
            Vec::new()
        } else {
            vec![question.to_string()]
        };
        self.simulator
            .run(job, &args)
            .await
            .map_err(PipelineError::Simulation)?;

        Ok(collect_result(job, &self.settings.artifacts, question).await?)
    }

    /// Downloads every listed object into `inputs/`, skipping failures
    /// individually. Returns how many objects were written.
    async fn materialize(
        &self,
        job: &JobWorkspace,
        keys: &[String],
        warnings: &mut Vec<String>,
    ) -> usize {
        let mut used_names = HashSet::new();
        let mut written = 0;

        for key in keys {
            if key.ends_with('/') {
                continue;
            }
            let Some(base_name) = sanitize_filename(key) else {
                warn!(request_id = %job.request_id(), "Skipping object with unusable name: {}", key);
                warnings.push(format!("Skipped '{}': unusable object name", key));
                continue;
            };

            // Keys from different prefixes may share a base name
            let mut file_name = base_name.clone();
            let mut n = 1;
            while !used_names.insert(file_name.clone()) {
                file_name = format!("{}-{}", n, base_name);
                n += 1;
            }

            let data = match self.storage.download(key).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(request_id = %job.request_id(), "⚠️  Download failed for {}: {:#}", key, e);
                    warnings.push(format!("Could not download '{}' for processing", key));
                    continue;
                }
            };

            if let Err(e) = job.write_input(&file_name, &data).await {
                warn!(request_id = %job.request_id(), "⚠️  Could not write {}: {}", file_name, e);
                warnings.push(format!("Could not prepare '{}' for processing", key));
                continue;
            }
            written += 1;
        }

        written
    }
}

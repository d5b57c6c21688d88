use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Connection settings for the S3-compatible object storage
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Endpoint URL of the storage backend (e.g. a Supabase or MinIO S3 endpoint)
    pub endpoint: Option<String>,

    pub access_key: Option<String>,

    pub secret_key: Option<String>,

    /// Bucket holding the uploaded PDFs (default: "pdfs")
    pub bucket: String,

    /// Region sent to the S3 client (default: "us-east-1")
    pub region: String,

    /// Base URL used to build public object URLs (default: the endpoint)
    pub public_url: Option<String>,

    /// Key prefix for uploads and listings (default: empty, the whole bucket)
    pub prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_key: None,
            secret_key: None,
            bucket: "pdfs".to_string(),
            region: "us-east-1".to_string(),
            public_url: None,
            prefix: String::new(),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            endpoint: non_empty_var("STORAGE_ENDPOINT"),
            access_key: non_empty_var("STORAGE_ACCESS_KEY"),
            secret_key: non_empty_var("STORAGE_SECRET_KEY"),
            bucket: non_empty_var("STORAGE_BUCKET").unwrap_or(default.bucket),
            region: non_empty_var("STORAGE_REGION").unwrap_or(default.region),
            public_url: non_empty_var("STORAGE_PUBLIC_URL"),
            prefix: env::var("STORAGE_PREFIX").unwrap_or(default.prefix),
        }
    }

    /// Names of the required settings that are absent
    pub fn missing_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.endpoint.is_none() {
            missing.push("STORAGE_ENDPOINT");
        }
        if self.access_key.is_none() {
            missing.push("STORAGE_ACCESS_KEY");
        }
        if self.secret_key.is_none() {
            missing.push("STORAGE_SECRET_KEY");
        }
        missing
    }
}

/// Runtime configuration for the upload and processing pipeline
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Maximum size of a single uploaded file in bytes (default: 50 MB)
    pub max_file_size: usize,

    /// Origins allowed by CORS
    pub allowed_origins: Vec<String>,

    /// Local directory where incoming parts are staged (default: "uploads")
    pub staging_dir: PathBuf,

    /// Root of the per-request job workspaces (default: "jobs")
    pub work_dir: PathBuf,

    /// Command line of the PDF extraction tool
    pub extractor_command: String,

    /// Command line of the simulation tool; the question is appended as one argument
    pub simulator_command: String,

    /// Per-tool timeout in seconds, 0 disables it (default: 0)
    pub process_timeout_secs: u64,

    /// Pipelines allowed to process at the same time (default: 2)
    pub max_concurrent_jobs: usize,

    /// Keep job workspaces and staged files after the request (default: false)
    pub keep_job_dirs: bool,

    /// File name of the full simulator output
    pub comprehensive_artifact: String,

    /// File name of the metrics-only simulator output
    pub metrics_artifact: String,

    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024, // 50 MB
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:5173".to_string(), // Vite default
                "http://127.0.0.1:5173".to_string(),
            ],
            staging_dir: PathBuf::from("uploads"),
            work_dir: PathBuf::from("jobs"),
            extractor_command:
                "python3 ./data-scripts/extractors/pdfProcessor.py {input_dir} {output_dir}"
                    .to_string(),
            simulator_command: "python3 ./montecarlo.py".to_string(),
            process_timeout_secs: 0,
            max_concurrent_jobs: 2,
            keep_job_dirs: false,
            comprehensive_artifact: "monte_carlo_analysis.json".to_string(),
            metrics_artifact: "computed_metrics.json".to_string(),
            storage: StorageConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            max_file_size: parsed_var("MAX_FILE_SIZE").unwrap_or(default.max_file_size),

            allowed_origins: env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| parse_origins(&v))
                .filter(|origins| !origins.is_empty())
                .unwrap_or(default.allowed_origins),

            staging_dir: non_empty_var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.staging_dir),

            work_dir: non_empty_var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.work_dir),

            extractor_command: non_empty_var("EXTRACTOR_COMMAND")
                .unwrap_or(default.extractor_command),

            simulator_command: non_empty_var("SIMULATOR_COMMAND")
                .unwrap_or(default.simulator_command),

            process_timeout_secs: parsed_var("PROCESS_TIMEOUT_SECS")
                .unwrap_or(default.process_timeout_secs),

            max_concurrent_jobs: parsed_var("MAX_CONCURRENT_JOBS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(default.max_concurrent_jobs),

            keep_job_dirs: env::var("KEEP_JOB_DIRS")
                .map(|v| parse_flag(&v))
                .unwrap_or(default.keep_job_dirs),

            comprehensive_artifact: non_empty_var("COMPREHENSIVE_ARTIFACT")
                .unwrap_or(default.comprehensive_artifact),

            metrics_artifact: non_empty_var("METRICS_ARTIFACT")
                .unwrap_or(default.metrics_artifact),

            storage: StorageConfig::from_env(),
        }
    }

    /// Create config for development and tests (temp-friendly relative dirs, no timeout)
    pub fn development() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            max_concurrent_jobs: 4,
            ..Self::default()
        }
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        (self.process_timeout_secs > 0).then(|| Duration::from_secs(self.process_timeout_secs))
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

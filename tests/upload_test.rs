use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use pdf_analysis_backend::config::AppConfig;
use pdf_analysis_backend::services::pipeline::{PipelineService, PipelineSettings};
use pdf_analysis_backend::services::storage::{StorageService, StoredObject};
use pdf_analysis_backend::services::tools::{AnalysisTool, ToolError, ToolOutput};
use pdf_analysis_backend::services::workspace::JobWorkspace;
use pdf_analysis_backend::{AppState, create_app};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "----pdf-analysis-test-boundary";
const PDF_BODY: &str = "%PDF-1.4\n1 0 obj\n<< /Type /Catalog >>\nendobj\n%%EOF";

// --- Mocks ---

#[derive(Default)]
struct MockStorage {
    objects: Mutex<BTreeMap<String, Bytes>>,
    fail_put: bool,
    fail_list: bool,
    broken_keys: HashSet<String>,
}

impl MockStorage {
    fn with_objects(objects: &[(&str, &str)]) -> Self {
        let storage = Self::default();
        {
            let mut map = storage.objects.lock().unwrap();
            for (key, data) in objects {
                map.insert(key.to_string(), Bytes::from(data.to_string()));
            }
        }
        storage
    }

    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl StorageService for MockStorage {
    async fn put(&self, name: &str, data: Bytes, _content_type: &str) -> Result<StoredObject> {
        if self.fail_put {
            return Err(anyhow!("access denied for secret-key=abc"));
        }
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(name) {
            return Err(anyhow!("object '{}' already exists", name));
        }
        objects.insert(name.to_string(), data);
        Ok(StoredObject {
            name: name.to_string(),
            storage_path: name.to_string(),
            public_url: self.public_url(name),
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        if self.fail_list {
            return Err(anyhow!("listing denied"));
        }
        Ok(self.keys())
    }

    async fn download(&self, key: &str) -> Result<Bytes> {
        if self.broken_keys.contains(key) {
            return Err(anyhow!("connection reset"));
        }
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no such key {}", key))
    }

    fn public_url(&self, storage_path: &str) -> String {
        format!("http://storage.test/pdfs/{}", storage_path)
    }

    async fn health(&self) -> bool {
        !self.fail_list
    }
}

/// Records which inputs it saw in `output/extracted.json`
struct MockExtractor;

#[async_trait]
impl AnalysisTool for MockExtractor {
    fn name(&self) -> &str {
        "mock-extractor"
    }

    async fn run(&self, job: &JobWorkspace, _args: &[String]) -> Result<ToolOutput, ToolError> {
        let inputs = job.input_files().await.unwrap_or_default();
        let extracted = json!({
            "inputs": inputs,
            "job_dir": job.root().to_string_lossy(),
            "request_id": job.request_id(),
        });
        tokio::fs::write(job.output_dir().join("extracted.json"), extracted.to_string())
            .await
            .map_err(|source| ToolError::Spawn {
                tool: self.name().to_string(),
                source,
            })?;
        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

#[derive(Clone, Copy)]
enum SimulatorMode {
    Comprehensive,
    MetricsOnly,
    Nothing,
    Fails,
}

/// Echoes the question and the extracted inputs into the configured artifact
struct MockSimulator {
    mode: SimulatorMode,
}

#[async_trait]
impl AnalysisTool for MockSimulator {
    fn name(&self) -> &str {
        "mock-simulator"
    }

    async fn run(&self, job: &JobWorkspace, args: &[String]) -> Result<ToolOutput, ToolError> {
        let question = args.first().cloned().unwrap_or_default();
        let extracted = tokio::fs::read_to_string(job.output_dir().join("extracted.json"))
            .await
            .unwrap_or_else(|_| "{}".to_string());
        let extracted: Value = serde_json::from_str(&extracted).unwrap_or(Value::Null);

        let (file, body) = match self.mode {
            SimulatorMode::Comprehensive => (
                "monte_carlo_analysis.json",
                json!({
                    "analysis_results": {
                        "question": &question,
                        "computed_answer": {
                            "asked": &question,
                            "inputs": extracted["inputs"],
                            "job_dir": extracted["job_dir"],
                            "request_id": extracted["request_id"],
                            "median_ending_cash": 1260000.0
                        },
                        "llm_explanation": "Cash stays positive in most scenarios."
                    },
                    "plot_generation": {"status": "skipped"}
                }),
            ),
            SimulatorMode::MetricsOnly => (
                "computed_metrics.json",
                json!({"burn_rate": 85000, "inputs": extracted["inputs"]}),
            ),
            SimulatorMode::Nothing => return Ok(ToolOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }),
            SimulatorMode::Fails => {
                return Err(ToolError::Failed {
                    tool: self.name().to_string(),
                    exit_code: Some(1),
                    stderr: "Traceback: /srv/secret/path".to_string(),
                });
            }
        };

        tokio::fs::write(job.artifact_path(file), body.to_string())
            .await
            .map_err(|source| ToolError::Spawn {
                tool: self.name().to_string(),
                source,
            })?;
        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

// --- Helpers ---

struct TestApp {
    app: Router,
    storage: Arc<MockStorage>,
    dirs: TempDir,
}

fn setup(storage: MockStorage, mode: SimulatorMode) -> TestApp {
    setup_with(storage, mode, AppConfig::development())
}

fn setup_with(storage: MockStorage, mode: SimulatorMode, base: AppConfig) -> TestApp {
    let dirs = tempfile::tempdir().unwrap();
    let config = AppConfig {
        staging_dir: dirs.path().join("uploads"),
        work_dir: dirs.path().join("jobs"),
        ..base
    };

    let storage = Arc::new(storage);
    let pipeline = Arc::new(PipelineService::new(
        storage.clone(),
        Arc::new(MockExtractor),
        Arc::new(MockSimulator { mode }),
        PipelineSettings::from(&config),
    ));

    TestApp {
        app: create_app(AppState::new(config, pipeline)),
        storage,
        dirs,
    }
}

enum Part<'a> {
    File {
        field: &'a str,
        name: &'a str,
        content_type: &'a str,
        body: &'a str,
    },
    Text {
        field: &'a str,
        value: &'a str,
    },
}

fn multipart_body(parts: &[Part]) -> String {
    let mut body = String::new();
    for part in parts {
        match part {
            Part::File {
                field,
                name,
                content_type,
                body: content,
            } => body.push_str(&format!(
                "--{BOUNDARY}\r\n\
                Content-Disposition: form-data; name=\"{field}\"; filename=\"{name}\"\r\n\
                Content-Type: {content_type}\r\n\r\n\
                {content}\r\n"
            )),
            Part::Text { field, value } => body.push_str(&format!(
                "--{BOUNDARY}\r\n\
                Content-Disposition: form-data; name=\"{field}\"\r\n\r\n\
                {value}\r\n"
            )),
        }
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));
    body
}

fn pdf<'a>(name: &'a str) -> Part<'a> {
    Part::File {
        field: "pdfFile",
        name,
        content_type: "application/pdf",
        body: PDF_BODY,
    }
}

async fn post_upload(app: &Router, parts: &[Part<'_>]) -> (StatusCode, Value) {
    send_upload(app, None, parts).await
}

async fn send_upload(
    app: &Router,
    request_id: Option<&str>,
    parts: &[Part<'_>],
) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        );
    if let Some(id) = request_id {
        request = request.header("x-request-id", id);
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::from(multipart_body(parts))).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap_or_else(|_| {
        panic!(
            "Non-JSON response {}: {}",
            status,
            String::from_utf8_lossy(&body)
        )
    });
    (status, json)
}

// --- Tests ---

#[tokio::test]
async fn test_upload_and_process_single_pdf() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let (status, json) = post_upload(
        &test.app,
        &[
            pdf("report.pdf"),
            Part::Text {
                field: "question",
                value: "What is the Q3 burn rate?",
            },
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(json["message"], "Files uploaded and processed successfully");
    assert!(!json["requestId"].as_str().unwrap().is_empty());

    let files = json["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["originalName"], "report.pdf");
    let stored_name = files[0]["storedName"].as_str().unwrap();
    assert!(stored_name.starts_with("pdfFile-"));
    assert!(stored_name.ends_with(".pdf"));
    assert_eq!(files[0]["supabasePath"], stored_name);
    assert_eq!(
        files[0]["publicUrl"],
        format!("http://storage.test/pdfs/{}", stored_name)
    );

    let data = &json["data"];
    assert_eq!(data["question"], "What is the Q3 burn rate?");
    assert_eq!(data["answer"]["asked"], "What is the Q3 burn rate?");
    assert_eq!(data["answer"]["inputs"], json!([stored_name]));
    assert_eq!(data["reasoning"], "Cash stays positive in most scenarios.");
    assert_eq!(data["source"], "comprehensive");
    assert!(data.get("plot").is_none());

    assert_eq!(test.storage.keys(), vec![stored_name.to_string()]);
}

#[tokio::test]
async fn test_multiple_files_and_historical_objects() {
    let storage = MockStorage::with_objects(&[
        ("pdfFile-1700000000000-1.pdf", "%PDF-1.4 old"),
        ("archive/", ""),
    ]);
    let test = setup(storage, SimulatorMode::Comprehensive);

    let (status, json) = post_upload(
        &test.app,
        &[
            Part::File {
                field: "pdfFiles",
                name: "q1.pdf",
                content_type: "application/pdf",
                body: PDF_BODY,
            },
            Part::File {
                field: "pdfFiles",
                name: "q2.pdf",
                content_type: "application/pdf",
                body: PDF_BODY,
            },
            Part::Text {
                field: "question",
                value: "Runway?",
            },
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", json);
    let files = json["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0]["originalName"], "q1.pdf");
    assert_eq!(files[1]["originalName"], "q2.pdf");
    assert_ne!(files[0]["storedName"], files[1]["storedName"]);

    // Whole bucket is processed, directory markers are skipped
    let inputs = json["data"]["answer"]["inputs"].as_array().unwrap();
    assert_eq!(inputs.len(), 3);
    assert!(inputs.contains(&json!("pdfFile-1700000000000-1.pdf")));
    assert_eq!(test.storage.keys().len(), 4);
}

#[tokio::test]
async fn test_no_file_uploaded() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let (status, json) = post_upload(
        &test.app,
        &[Part::Text {
            field: "question",
            value: "Anything?",
        }],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json, json!({"message": "No file uploaded"}));
    assert!(test.storage.keys().is_empty());
}

#[tokio::test]
async fn test_empty_file_part_counts_as_no_file() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let (status, json) = post_upload(
        &test.app,
        &[Part::File {
            field: "pdfFile",
            name: "",
            content_type: "application/octet-stream",
            body: "",
        }],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "No file uploaded");
}

#[tokio::test]
async fn test_non_pdf_rejects_whole_request() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let (status, json) = post_upload(
        &test.app,
        &[
            pdf("good.pdf"),
            Part::File {
                field: "pdfFile",
                name: "notes.txt",
                content_type: "text/plain",
                body: "hello",
            },
        ],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "Only PDF files are allowed");
    assert!(test.storage.keys().is_empty());
}

#[tokio::test]
async fn test_pdf_content_type_with_wrong_bytes_is_rejected() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let (status, _) = post_upload(
        &test.app,
        &[Part::File {
            field: "pdfFile",
            name: "fake.pdf",
            content_type: "application/pdf",
            body: "MZ this is not a pdf",
        }],
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(test.storage.keys().is_empty());
}

#[tokio::test]
async fn test_storage_put_failure_is_500() {
    let storage = MockStorage {
        fail_put: true,
        ..MockStorage::default()
    };
    let test = setup(storage, SimulatorMode::Comprehensive);

    let (status, json) = post_upload(&test.app, &[pdf("report.pdf")]).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["message"], "Failed to upload report.pdf to storage");
    assert!(!json.to_string().contains("secret-key"));
    assert!(json.get("files").is_none());
}

#[tokio::test]
async fn test_listing_failure_skips_processing() {
    let storage = MockStorage {
        fail_list: true,
        ..MockStorage::default()
    };
    let test = setup(storage, SimulatorMode::Comprehensive);

    let (status, json) = post_upload(&test.app, &[pdf("report.pdf")]).await;

    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(
        json["message"],
        "Files uploaded successfully, but processing was skipped"
    );
    assert_eq!(json["files"].as_array().unwrap().len(), 1);
    assert!(json.get("data").is_none());
    assert_eq!(json["warnings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_partial_download_failure_is_reported() {
    let mut storage = MockStorage::with_objects(&[("broken.pdf", "%PDF-1.4 x")]);
    storage.broken_keys.insert("broken.pdf".to_string());
    let test = setup(storage, SimulatorMode::Comprehensive);

    let (status, json) = post_upload(&test.app, &[pdf("report.pdf")]).await;

    assert_eq!(status, StatusCode::OK, "{}", json);
    assert_eq!(
        json["warnings"],
        json!(["Could not download 'broken.pdf' for processing"])
    );
    let inputs = json["data"]["answer"]["inputs"].as_array().unwrap();
    assert_eq!(inputs.len(), 1);
    assert!(!inputs.contains(&json!("broken.pdf")));
}

#[tokio::test]
async fn test_metrics_only_fallback() {
    let test = setup(MockStorage::default(), SimulatorMode::MetricsOnly);

    let (status, json) = post_upload(
        &test.app,
        &[
            pdf("report.pdf"),
            Part::Text {
                field: "question",
                value: "Burn?",
            },
        ],
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{}", json);
    let data = &json["data"];
    assert_eq!(data["question"], "Burn?");
    assert_eq!(data["answer"]["burn_rate"], 85000);
    assert_eq!(data["source"], "metricsOnly");
    assert_eq!(
        data["reasoning"],
        "Detailed reasoning is not available for this analysis; showing computed metrics only."
    );
}

#[tokio::test]
async fn test_missing_artifacts_is_500() {
    let test = setup(MockStorage::default(), SimulatorMode::Nothing);

    let (status, json) = post_upload(&test.app, &[pdf("report.pdf")]).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["message"], "The analysis did not produce a result");
    // The upload itself already happened
    assert_eq!(test.storage.keys().len(), 1);
}

#[tokio::test]
async fn test_simulator_failure_hides_stderr() {
    let test = setup(MockStorage::default(), SimulatorMode::Fails);

    let (status, json) = post_upload(&test.app, &[pdf("report.pdf")]).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["message"], "Simulation failed");
    assert!(!json.to_string().contains("/srv/secret"));
}

#[tokio::test]
async fn test_concurrent_requests_keep_their_own_question() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let first = [
        pdf("a.pdf"),
        Part::Text {
            field: "question",
            value: "What is the runway?",
        },
    ];
    let second = [
        pdf("b.pdf"),
        Part::Text {
            field: "question",
            value: "What is the burn rate?",
        },
    ];

    let ((status_a, json_a), (status_b, json_b)) = futures::join!(
        post_upload(&test.app, &first),
        post_upload(&test.app, &second)
    );

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(json_a["data"]["question"], "What is the runway?");
    assert_eq!(json_b["data"]["question"], "What is the burn rate?");
    assert_eq!(json_a["data"]["answer"]["asked"], "What is the runway?");
    assert_eq!(json_b["data"]["answer"]["asked"], "What is the burn rate?");
    assert_ne!(json_a["requestId"], json_b["requestId"]);

    // Each job ran in its own workspace, named after its own request
    let answer_a = &json_a["data"]["answer"];
    let answer_b = &json_b["data"]["answer"];
    assert_eq!(answer_a["request_id"], json_a["requestId"]);
    assert_eq!(answer_b["request_id"], json_b["requestId"]);
    assert_ne!(answer_a["job_dir"], answer_b["job_dir"]);
    for (json, answer) in [(&json_a, answer_a), (&json_b, answer_b)] {
        let job_dir = answer["job_dir"].as_str().unwrap();
        let request_id = json["requestId"].as_str().unwrap();
        let job_name = std::path::Path::new(job_dir).file_name().unwrap();
        assert!(job_name.to_string_lossy().starts_with(request_id));
    }

    // A job always sees its own upload, and nothing that is not in the bucket
    let bucket = test.storage.keys();
    for (json, answer) in [(&json_a, answer_a), (&json_b, answer_b)] {
        let own = json["files"][0]["storedName"].clone();
        let inputs = answer["inputs"].as_array().unwrap();
        assert!(inputs.contains(&own));
        assert!(
            inputs
                .iter()
                .all(|name| bucket.contains(&name.as_str().unwrap().to_string()))
        );
    }
}

#[tokio::test]
async fn test_retry_with_same_request_id_succeeds() {
    let config = AppConfig {
        keep_job_dirs: true,
        ..AppConfig::development()
    };
    let test = setup_with(MockStorage::default(), SimulatorMode::Comprehensive, config);

    for attempt in 1..=2 {
        let (status, json) = send_upload(&test.app, Some("retry-1"), &[pdf("report.pdf")]).await;
        assert_eq!(status, StatusCode::OK, "attempt {}: {}", attempt, json);
        assert_eq!(json["requestId"], "retry-1");
        assert_eq!(test.storage.keys().len(), attempt);
    }

    let mut entries = tokio::fs::read_dir(test.dirs.path().join("jobs"))
        .await
        .unwrap();
    let mut job_dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        job_dirs.push(entry.file_name().to_string_lossy().to_string());
    }
    assert_eq!(job_dirs.len(), 2);
    assert!(job_dirs.iter().all(|name| name.starts_with("retry-1-")));
}

#[tokio::test]
async fn test_request_id_header_is_echoed() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/upload")
                .header("x-request-id", "client-req-42")
                .header(
                    "Content-Type",
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body(&[pdf("report.pdf")])))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "client-req-42");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["requestId"], "client-req-42");
}

#[tokio::test]
async fn test_health_endpoint() {
    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["storage"], "connected");
    assert_eq!(json["activeJobs"], 0);
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_http_span_carries_generated_request_id() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let test = setup(MockStorage::default(), SimulatorMode::Comprehensive);
    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response.headers()["x-request-id"]
        .to_str()
        .unwrap()
        .to_string();

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains("GET /health"), "{}", output);
    assert!(
        output.contains(&format!("request_id={}", request_id)),
        "{}",
        output
    );
    assert!(!output.contains("request_id=unknown"), "{}", output);
}

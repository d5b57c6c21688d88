use crate::services::workspace::JobWorkspace;
use crate::utils::validation::sanitize_filename;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use utoipa::ToSchema;

/// Reasoning returned when only the metrics artifact is available
pub const METRICS_ONLY_REASONING: &str =
    "Detailed reasoning is not available for this analysis; showing computed metrics only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ResultSource {
    Comprehensive,
    MetricsOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlotImage {
    pub file_name: String,
    pub mime_type: String,
    pub data_base64: String,
}

/// Canonical result of one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub question: String,
    /// Metric name to number, string or nested group of metrics
    #[schema(value_type = Object)]
    pub answer: Map<String, Value>,
    pub reasoning: String,
    pub source: ResultSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<PlotImage>,
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("no analysis artifact was produced (expected {comprehensive} or {metrics})")]
    Missing {
        comprehensive: String,
        metrics: String,
    },

    #[error("failed to read artifact {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {artifact} is not valid JSON: {source}")]
    Malformed {
        artifact: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact {0} does not contain a metrics object")]
    UnexpectedShape(String),
}

/// File names the simulator writes into its working directory
#[derive(Debug, Clone)]
pub struct ArtifactNames {
    pub comprehensive: String,
    pub metrics: String,
}

/// What a comprehensive artifact contributes before the plot is loaded
#[derive(Debug, Default, PartialEq)]
struct Comprehensive {
    question: Option<String>,
    answer: Map<String, Value>,
    reasoning: Option<String>,
    plot_file: Option<String>,
}

/// Reads the simulator output of a job and normalizes it.
///
/// The comprehensive artifact wins when present and usable, otherwise the
/// metrics-only artifact is used with `METRICS_ONLY_REASONING`. The question
/// the caller supplied takes precedence over the one echoed by the tool.
pub async fn collect_result(
    job: &JobWorkspace,
    names: &ArtifactNames,
    question: &str,
) -> Result<AnalysisResult, ArtifactError> {
    let comprehensive_path = job.artifact_path(&names.comprehensive);
    if let Some(value) = read_json(&comprehensive_path, &names.comprehensive).await? {
        match parse_comprehensive(&value) {
            Some(parsed) => {
                let plot = match parsed.plot_file.as_deref() {
                    Some(file) => load_plot(job.root(), file).await,
                    None => None,
                };
                return Ok(AnalysisResult {
                    question: pick_question(question, parsed.question),
                    answer: parsed.answer,
                    reasoning: parsed
                        .reasoning
                        .unwrap_or_else(|| METRICS_ONLY_REASONING.to_string()),
                    source: ResultSource::Comprehensive,
                    plot,
                });
            }
            None => tracing::warn!(
                request_id = %job.request_id(),
                "Artifact {} has no recognised result shape, trying {}",
                names.comprehensive,
                names.metrics
            ),
        }
    }

    let metrics_path = job.artifact_path(&names.metrics);
    match read_json(&metrics_path, &names.metrics).await? {
        Some(Value::Object(answer)) => Ok(AnalysisResult {
            question: question.to_string(),
            answer,
            reasoning: METRICS_ONLY_REASONING.to_string(),
            source: ResultSource::MetricsOnly,
            plot: None,
        }),
        Some(_) => Err(ArtifactError::UnexpectedShape(names.metrics.clone())),
        None => Err(ArtifactError::Missing {
            comprehensive: names.comprehensive.clone(),
            metrics: names.metrics.clone(),
        }),
    }
}

async fn read_json(path: &Path, artifact: &str) -> Result<Option<Value>, ArtifactError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| ArtifactError::Malformed {
            artifact: artifact.to_string(),
            source,
        })
}

/// Accepts `{analysis_results: {computed_answer, metrics, llm_explanation}}`
/// and the direct `{question, answer, reasoning}` shape, optionally wrapped
/// in an `analysis` object.
fn parse_comprehensive(value: &Value) -> Option<Comprehensive> {
    let value = value.get("analysis").filter(|v| v.is_object()).unwrap_or(value);

    if let Some(results) = value.get("analysis_results").filter(|v| v.is_object()) {
        let mut answer = results
            .get("computed_answer")
            .map(into_metric_map)
            .unwrap_or_default();
        if let Some(Value::Object(metrics)) = results.get("metrics") {
            for (key, metric) in metrics {
                answer.entry(key.clone()).or_insert_with(|| metric.clone());
            }
        }

        let question = non_empty_str(results.get("question")).or_else(|| {
            non_empty_str(
                value
                    .get("query_analysis")
                    .and_then(|q| q.get("original_question")),
            )
        });

        return Some(Comprehensive {
            question,
            answer,
            reasoning: non_empty_str(results.get("llm_explanation")),
            plot_file: announced_plot(value),
        });
    }

    let answer = value.get("answer")?;
    Some(Comprehensive {
        question: non_empty_str(value.get("question")),
        answer: into_metric_map(answer),
        reasoning: non_empty_str(value.get("reasoning"))
            .or_else(|| non_empty_str(value.get("interpretation"))),
        plot_file: announced_plot(value),
    })
}

/// Scalar answers are kept under an `answer` key so the map stays an object
fn into_metric_map(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("answer".to_string(), other.clone());
            map
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn announced_plot(value: &Value) -> Option<String> {
    let plot = value.get("plot_generation")?;
    match plot.get("status").and_then(Value::as_str) {
        Some("skipped") | Some("failed") => None,
        _ => non_empty_str(plot.get("file")),
    }
}

fn pick_question(supplied: &str, from_artifact: Option<String>) -> String {
    if supplied.trim().is_empty() {
        from_artifact.unwrap_or_default()
    } else {
        supplied.to_string()
    }
}

async fn load_plot(job_dir: &Path, file: &str) -> Option<PlotImage> {
    // Only plain file names inside the job directory are followed
    let file_name = sanitize_filename(file).filter(|name| name == file)?;
    let data = match tokio::fs::read(job_dir.join(&file_name)).await {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("Announced plot {} could not be read: {}", file_name, e);
            return None;
        }
    };

    let mime_type = infer::get(&data)
        .map(|kind| kind.mime_type().to_string())
        .filter(|m| m.starts_with("image/"))
        .unwrap_or_else(|| mime::IMAGE_PNG.essence_str().to_string());

    Some(PlotImage {
        file_name,
        mime_type,
        data_base64: STANDARD.encode(&data),
    })
}

pub mod api;
pub mod config;
pub mod infrastructure;
pub mod services;
pub mod utils;

use crate::api::handlers::upload::MAX_FILES_PER_REQUEST;
use crate::api::middleware::request_id::{REQUEST_ID_HEADER, request_id_middleware};
use crate::config::AppConfig;
use crate::services::pipeline::PipelineService;
use crate::services::staging::StagingArea;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, Request, Response},
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_pdfs,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::types::UploadForm,
            api::handlers::types::UploadEnvelope,
            api::handlers::types::FileSummary,
            api::handlers::types::ErrorResponse,
            api::handlers::health::HealthResponse,
            services::analysis::AnalysisResult,
            services::analysis::PlotImage,
            services::analysis::ResultSource,
        )
    ),
    tags(
        (name = "upload", description = "PDF upload and analysis"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<PipelineService>,
    pub staging: StagingArea,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig, pipeline: Arc<PipelineService>) -> Self {
        Self {
            staging: StagingArea::new(config.staging_dir.clone(), config.max_file_size),
            pipeline,
            config,
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
}

pub fn create_app(state: AppState) -> Router {
    // Per-file size is enforced while staging; this caps the whole body
    let body_limit = state
        .config
        .max_file_size
        .saturating_mul(MAX_FILES_PER_REQUEST)
        .saturating_add(1024 * 1024);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id,
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!("📥 {} {}", request.method(), request.uri());
        })
        .on_response(
            |response: &Response<_>, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    "📤 Finished in {:?} with status {}",
                    latency,
                    response.status()
                );
            },
        );

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/upload", post(api::handlers::upload::upload_pdfs))
        .layer(trace_layer)
        // Outside the trace layer so spans see the assigned id
        .layer(from_fn(request_id_middleware))
        .layer(cors_layer(&state.config.allowed_origins))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

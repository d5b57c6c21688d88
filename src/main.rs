use clap::Parser;
use dotenvy::dotenv;
use pdf_analysis_backend::config::AppConfig;
use pdf_analysis_backend::infrastructure::{storage, tools};
use pdf_analysis_backend::services::pipeline::{PipelineService, PipelineSettings};
use pdf_analysis_backend::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 3001;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port for the API server (falls back to PORT, then 3001)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Environment & Logging
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdf_analysis_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting PDF Analysis Backend...");

    let config = AppConfig::from_env();
    info!(
        "🛡️  Config: Max Size={}MB, Staging={}, Jobs={}, Max Concurrent Jobs={}",
        config.max_file_size / 1024 / 1024,
        config.staging_dir.display(),
        config.work_dir.display(),
        config.max_concurrent_jobs
    );

    // 2. Storage & Tools
    let storage_service = storage::setup_storage(&config.storage).await;
    let tool_set = tools::setup_tools(&config)?;

    let pipeline = Arc::new(PipelineService::new(
        storage_service,
        tool_set.extractor,
        tool_set.simulator,
        PipelineSettings::from(&config),
    ));

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(DEFAULT_PORT);

    let state = AppState::new(config, pipeline);

    let app = create_app(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("✅ API Server listening on: http://0.0.0.0:{}", port);
    info!("📖 Swagger UI documentation: http://localhost:{}/swagger-ui", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Backend exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}

use clap::Parser;
use pdf_analysis_backend::services::report::{normalize_envelope, render_text};
use std::io::Read;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Print an /upload response as metric cards
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file with the response body (reads stdin when omitted)
    path: Option<PathBuf>,

    /// Emit the normalized view as JSON instead of text
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "render_report=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let raw = match &args.path {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let envelope: serde_json::Value = serde_json::from_str(&raw)?;
    let Some(view) = normalize_envelope(&envelope) else {
        error!("❌ No analysis found in the response (was processing skipped?)");
        std::process::exit(1);
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", render_text(&view));
    }

    Ok(())
}

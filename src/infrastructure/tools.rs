use crate::config::AppConfig;
use crate::services::tools::{AnalysisTool, CommandSpec, CommandTool};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

pub const EXTRACTOR_NAME: &str = "pdf-extractor";
pub const SIMULATOR_NAME: &str = "monte-carlo-simulator";

pub struct ToolSet {
    pub extractor: Arc<dyn AnalysisTool>,
    pub simulator: Arc<dyn AnalysisTool>,
}

/// Builds the subprocess tools. Relative script paths are anchored to the
/// directory the server was started from.
pub fn setup_tools(config: &AppConfig) -> anyhow::Result<ToolSet> {
    let base_dir = std::env::current_dir().context("cannot determine the working directory")?;
    let timeout = config.process_timeout();

    let extractor = CommandSpec::parse(EXTRACTOR_NAME, &config.extractor_command, &base_dir)?;
    let simulator = CommandSpec::parse(SIMULATOR_NAME, &config.simulator_command, &base_dir)?;

    info!("🧾 Extractor: {} {}", extractor.program, extractor.args.join(" "));
    info!("🎲 Simulator: {} {}", simulator.program, simulator.args.join(" "));
    match timeout {
        Some(t) => info!("⏱️  Tool timeout: {:?}", t),
        None => info!("⏱️  Tool timeout: disabled"),
    }

    Ok(ToolSet {
        extractor: Arc::new(CommandTool::new(EXTRACTOR_NAME, extractor, timeout)),
        simulator: Arc::new(CommandTool::new(SIMULATOR_NAME, simulator, timeout)),
    })
}

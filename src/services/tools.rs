use crate::services::workspace::JobWorkspace;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Longest stderr excerpt carried inside a `ToolError`
const STDERR_EXCERPT_LEN: usize = 2000;

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} has an invalid command line: {reason}")]
    InvalidCommand { tool: String, reason: String },

    #[error("{tool} could not be started: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {}: {stderr}", .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} did not finish within {}s", .timeout.as_secs())]
    TimedOut { tool: String, timeout: Duration },
}

/// An external processing step: reads the job's inputs, writes artifacts
/// into the job directory, signals success through its exit status.
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, job: &JobWorkspace, args: &[String]) -> Result<ToolOutput, ToolError>;
}

/// Program and fixed arguments of an external tool.
///
/// Arguments may contain `{input_dir}`, `{output_dir}`, `{job_dir}` and
/// `{request_id}`, expanded per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a whitespace separated command line. Tokens starting with
    /// `./` or `../` are resolved against `base_dir`, since tools run inside
    /// the job directory.
    pub fn parse(tool: &str, line: &str, base_dir: &Path) -> Result<Self, ToolError> {
        let mut tokens = line.split_whitespace().map(|token| {
            if token.starts_with("./") || token.starts_with("../") {
                base_dir.join(token).to_string_lossy().into_owned()
            } else {
                token.to_string()
            }
        });

        let program = tokens.next().ok_or_else(|| ToolError::InvalidCommand {
            tool: tool.to_string(),
            reason: "command line is empty".to_string(),
        })?;

        Ok(Self::new(program, tokens.collect()))
    }

    fn expanded_args(&self, job: &JobWorkspace) -> Vec<String> {
        let input_dir = job.input_dir().to_string_lossy().into_owned();
        let output_dir = job.output_dir().to_string_lossy().into_owned();
        let job_dir = job.root().to_string_lossy().into_owned();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input_dir}", &input_dir)
                    .replace("{output_dir}", &output_dir)
                    .replace("{job_dir}", &job_dir)
                    .replace("{request_id}", job.request_id())
            })
            .collect()
    }
}

/// Runs a tool as a child process, one per job, without a shell
pub struct CommandTool {
    name: String,
    spec: CommandSpec,
    timeout: Option<Duration>,
}

impl CommandTool {
    pub fn new(name: impl Into<String>, spec: CommandSpec, timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            spec,
            timeout,
        }
    }
}

#[async_trait]
impl AnalysisTool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, job: &JobWorkspace, args: &[String]) -> Result<ToolOutput, ToolError> {
        let mut command = Command::new(&self.spec.program);
        command
            .args(self.spec.expanded_args(job))
            // Extra arguments go through argv untouched: quotes need no escaping
            .args(args)
            .current_dir(job.root())
            .env("PIPELINE_REQUEST_ID", job.request_id())
            .env("PIPELINE_JOB_DIR", job.root())
            .env("PIPELINE_INPUT_DIR", job.input_dir())
            .env("PIPELINE_OUTPUT_DIR", job.output_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            request_id = %job.request_id(),
            "⚙️  Running {}: {} ({} extra args)",
            self.name,
            self.spec.program,
            args.len()
        );

        let started = std::time::Instant::now();
        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, command.output())
                .await
                .map_err(|_| ToolError::TimedOut {
                    tool: self.name.clone(),
                    timeout,
                })?,
            None => command.output().await,
        }
        .map_err(|source| ToolError::Spawn {
            tool: self.name.clone(),
            source,
        })?;

        let result = ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.stdout.trim().is_empty() {
            tracing::debug!(request_id = %job.request_id(), "{} stdout:\n{}", self.name, result.stdout.trim_end());
        }
        if !result.stderr.trim().is_empty() {
            tracing::warn!(request_id = %job.request_id(), "{} stderr:\n{}", self.name, result.stderr.trim_end());
        }

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.name.clone(),
                exit_code: result.exit_code,
                stderr: stderr_excerpt(&result.stderr),
            });
        }

        tracing::info!(
            request_id = %job.request_id(),
            "✅ {} finished in {:?}",
            self.name,
            started.elapsed()
        );
        Ok(result)
    }
}

/// Trailing part of stderr, where tracebacks put the actual error
fn stderr_excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_EXCERPT_LEN;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Slurm is not available on this system")]
    BackendUnavailable,
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("{command} was rejected by the scheduler (exit code {exit_code}): {stderr}")]
    SchedulerRejected {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("Unexpected {command} output: {message}\n{output}")]
    ProtocolMismatch {
        command: String,
        message: String,
        output: String,
    },
    #[error("{command} did not finish within {}", format_timeout(.timeout))]
    Timeout { command: String, timeout: Duration },
    #[error("{0}")]
    NotFound(String),
    #[error("Output of job {job_id} is not available yet (tried {})", format_paths(.candidates))]
    OutputNotFound {
        job_id: String,
        candidates: Vec<PathBuf>,
    },
    #[error("Cannot start {program}: {message}")]
    Spawn { program: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BatchError {
    /// Stable identifier of the error kind, used by the result envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::BackendUnavailable => "backend_unavailable",
            BatchError::Validation(_) => "validation",
            BatchError::SchedulerRejected { .. } => "scheduler_rejected",
            BatchError::ProtocolMismatch { .. } => "protocol_mismatch",
            BatchError::Timeout { .. } => "timeout",
            BatchError::NotFound(_) => "not_found",
            BatchError::OutputNotFound { .. } => "output_not_found",
            BatchError::Spawn { .. } => "spawn",
            BatchError::Io(_) => "io",
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        BatchError::Validation(message.into())
    }
}

fn format_timeout(timeout: &Duration) -> String {
    humantime::format_duration(*timeout).to_string()
}

fn format_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no candidate paths".to_string();
    }
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<anyhow::Error> for BatchError {
    fn from(error: anyhow::Error) -> Self {
        Self::Validation(format!("{error:#}"))
    }
}

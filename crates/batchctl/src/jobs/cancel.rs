use crate::backend::{Backend, Invocation};
use crate::common::error::BatchResult;
use crate::jobs::record::{CancellationResult, CancellationStatus};
use crate::jobs::spec::validate_job_id;

/// Cancels jobs with `scancel`.
#[derive(Clone)]
pub struct CancellationManager {
    backend: Backend,
}

impl CancellationManager {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Requests cancellation of a job.
    ///
    /// A refusal by Slurm (unknown or already finished job) is reported as
    /// [`CancellationStatus::Error`], not as an error of the call.
    pub async fn cancel(&self, job_id: &str) -> BatchResult<CancellationResult> {
        validate_job_id(job_id)?;
        self.backend.ensure_available().await?;

        let output = self
            .backend
            .query(Invocation::new(&self.backend.binaries().scancel).arg(job_id))
            .await?;
        let result = if output.success() {
            log::info!("Job {job_id} cancelled");
            CancellationResult {
                job_id: job_id.to_string(),
                status: CancellationStatus::Cancelled,
                message: format!("Job {job_id} cancelled"),
            }
        } else {
            let stderr = output.stderr.trim();
            log::debug!("scancel of job {job_id} failed: {stderr}");
            CancellationResult {
                job_id: job_id.to_string(),
                status: CancellationStatus::Error,
                message: if stderr.is_empty() {
                    format!("scancel exited with code {}", output.exit_code)
                } else {
                    stderr.to_string()
                },
            }
        };
        Ok(result)
    }
}

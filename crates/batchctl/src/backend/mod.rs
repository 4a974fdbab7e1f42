pub mod probe;
pub mod runner;
pub mod slurm;

use std::sync::Arc;

pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner};

use crate::common::error::{BatchError, BatchResult};
use crate::config::{BackendConfig, SlurmBinaries};

/// Handle to a Slurm installation: a command runner plus the configuration
/// describing how to talk to it. Cheap to clone.
#[derive(Clone)]
pub struct Backend {
    runner: Arc<dyn CommandRunner>,
    config: Arc<BackendConfig>,
}

impl Backend {
    pub fn new(runner: Arc<dyn CommandRunner>, config: BackendConfig) -> Self {
        Self {
            runner,
            config: Arc::new(config),
        }
    }

    /// Backend that executes the Slurm tools as local processes.
    pub fn local(config: BackendConfig) -> Self {
        let runner = Arc::new(ProcessRunner::new(config.kill_grace));
        Self::new(runner, config)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn binaries(&self) -> &SlurmBinaries {
        &self.config.binaries
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub async fn probe(&self) -> bool {
        probe::probe(self.runner.as_ref(), &self.config).await
    }

    pub async fn version(&self) -> Option<String> {
        probe::probe_version(self.runner.as_ref(), &self.config).await
    }

    pub async fn ensure_available(&self) -> BatchResult<()> {
        if self.probe().await {
            Ok(())
        } else {
            Err(BatchError::BackendUnavailable)
        }
    }

    /// Runs the invocation as is.
    pub async fn run(&self, invocation: Invocation) -> BatchResult<CommandOutput> {
        self.runner.run(invocation).await
    }

    /// Runs a short query, bounded by the configured query timeout unless the
    /// invocation carries its own.
    pub async fn query(&self, mut invocation: Invocation) -> BatchResult<CommandOutput> {
        if invocation.timeout.is_none() {
            invocation.timeout = Some(self.config.query_timeout);
        }
        self.runner.run(invocation).await
    }

    /// Like [`Backend::query`], but a non-zero exit code is turned into
    /// [`BatchError::SchedulerRejected`].
    pub async fn query_checked(&self, invocation: Invocation) -> BatchResult<CommandOutput> {
        let command = invocation.program().to_string();
        let output = self.query(invocation).await?;
        if !output.success() {
            return Err(BatchError::SchedulerRejected {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

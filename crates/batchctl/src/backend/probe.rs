use crate::backend::runner::{CommandRunner, Invocation};
use crate::config::BackendConfig;

/// Queries the Slurm version with `sinfo --version`.
///
/// Returns `None` if the binary is missing, exits with a non-zero code or does not
/// answer within the probe timeout.
pub async fn probe_version(runner: &dyn CommandRunner, config: &BackendConfig) -> Option<String> {
    let invocation = Invocation::new(&config.binaries.sinfo)
        .arg("--version")
        .with_timeout(config.probe_timeout);
    match runner.run(invocation).await {
        Ok(output) if output.success() => {
            let version = output.stdout.trim().to_string();
            log::debug!("Slurm detected: {version}");
            Some(version)
        }
        Ok(output) => {
            log::debug!(
                "Slurm probe exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
            None
        }
        Err(error) => {
            log::debug!("Slurm probe failed: {error}");
            None
        }
    }
}

/// Returns true if the Slurm tools are installed and responding.
pub async fn probe(runner: &dyn CommandRunner, config: &BackendConfig) -> bool {
    probe_version(runner, config).await.is_some()
}

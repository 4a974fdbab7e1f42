use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::common::fsutils::absolute_path;
use crate::common::serialization::duration;

pub const CONFIG_ENV: &str = "BATCHCTL_CONFIG";
const OUTPUT_DIR_ENV: &str = "BATCHCTL_OUTPUT_DIR";
const QUERY_TIMEOUT_ENV: &str = "BATCHCTL_QUERY_TIMEOUT_MS";
const PROBE_TIMEOUT_ENV: &str = "BATCHCTL_PROBE_TIMEOUT_MS";
const IMMEDIATE_WAIT_ENV: &str = "BATCHCTL_IMMEDIATE_WAIT_MS";

/// Names (or paths) of the Slurm executables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SlurmBinaries {
    pub sbatch: String,
    pub squeue: String,
    pub scontrol: String,
    pub scancel: String,
    pub sinfo: String,
    pub salloc: String,
    pub sacct: String,
}

impl Default for SlurmBinaries {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            scontrol: "scontrol".to_string(),
            scancel: "scancel".to_string(),
            sinfo: "sinfo".to_string(),
            salloc: "salloc".to_string(),
            sacct: "sacct".to_string(),
        }
    }
}

/// Configuration of a single Slurm target.
///
/// It is constructed once and handed to every manager, so several
/// differently configured backends can live in one process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub binaries: SlurmBinaries,
    /// Directory where batch job stdout/stderr files are written.
    pub output_dir: PathBuf,
    /// Timeout of the availability probe.
    #[serde(with = "duration")]
    pub probe_timeout: Duration,
    /// Timeout of every other non-allocation command.
    #[serde(with = "duration")]
    pub query_timeout: Duration,
    /// How long an immediate allocation may wait for the scheduler's answer.
    #[serde(with = "duration")]
    pub immediate_wait: Duration,
    /// Delay between SIGTERM and SIGKILL when a command has to be terminated.
    #[serde(with = "duration")]
    pub kill_grace: Duration,
    pub default_alloc_time_limit: String,
    pub alloc_job_name: String,
    /// Consult `sacct` for jobs that already left the live queue.
    pub use_accounting: bool,
    /// Where the allocation registry is persisted between CLI invocations.
    pub state_file: Option<PathBuf>,
    /// How long released and failed allocations are kept in the persisted registry.
    #[serde(with = "duration")]
    pub registry_retention: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binaries: SlurmBinaries::default(),
            output_dir: PathBuf::from("logs/slurm_output"),
            probe_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(60),
            immediate_wait: Duration::from_secs(10),
            kill_grace: Duration::from_secs(1),
            default_alloc_time_limit: "01:00:00".to_string(),
            alloc_job_name: "batchctl_allocation".to_string(),
            use_accounting: true,
            state_file: None,
            registry_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl BackendConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: BackendConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration in the following order:
    /// defaults, TOML file, environment variables.
    ///
    /// If `path` is not given, `$BATCHCTL_CONFIG` and then
    /// `<user config dir>/batchctl/config.toml` are tried.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.is_file()),
        };
        let mut config = match file {
            Some(file) => {
                log::debug!("Loading configuration from {}", file.display());
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("Cannot read config file {}", file.display()))?;
                Self::from_toml(&content)
                    .with_context(|| format!("Invalid config file {}", file.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.output_dir = absolute_path(config.output_dir);
        config.state_file = config.state_file.map(absolute_path);
        Ok(config)
    }

    /// Applies environment-style overrides. Values that cannot be parsed are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(OUTPUT_DIR_ENV).filter(|dir| !dir.is_empty()) {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = get_duration(&lookup, QUERY_TIMEOUT_ENV) {
            self.query_timeout = timeout;
        }
        if let Some(timeout) = get_duration(&lookup, PROBE_TIMEOUT_ENV) {
            self.probe_timeout = timeout;
        }
        if let Some(wait) = get_duration(&lookup, IMMEDIATE_WAIT_ENV) {
            self.immediate_wait = wait;
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        crate::common::timeutils::parse_time_limit(&self.default_alloc_time_limit)
            .context("Invalid `default_alloc_time_limit`")?;
        if self.alloc_job_name.is_empty()
            || self.alloc_job_name.chars().any(|c| c.is_whitespace())
        {
            anyhow::bail!("`alloc_job_name` must be a non-empty name without whitespace");
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => Some(PathBuf::from(path)),
        None => dirs::config_dir().map(|dir| dir.join("batchctl").join("config.toml")),
    }
}

fn get_duration(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    lookup(key)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::BackendConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn parse_empty_config() {
        assert_eq!(BackendConfig::from_toml("").unwrap(), BackendConfig::default());
    }

    #[test]
    fn parse_partial_config() {
        let config = BackendConfig::from_toml(
            r#"
output_dir = "/scratch/out"
query_timeout = "2m"
use_accounting = false

[binaries]
sbatch = "/opt/slurm/bin/sbatch"
"#,
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/scratch/out"));
        assert_eq!(config.query_timeout, Duration::from_secs(120));
        assert!(!config.use_accounting);
        assert_eq!(config.binaries.sbatch, "/opt/slurm/bin/sbatch");
        assert_eq!(config.binaries.squeue, "squeue");
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.registry_retention, Duration::from_secs(7 * 24 * 3600));

        let config = BackendConfig::from_toml(r#"registry_retention = "12h""#).unwrap();
        assert_eq!(config.registry_retention, Duration::from_secs(12 * 3600));
    }

    #[test]
    fn parse_invalid_config() {
        assert!(BackendConfig::from_toml(r#"query_timeout = "soon""#).is_err());
        assert!(BackendConfig::from_toml(r#"default_alloc_time_limit = "1h""#).is_err());
        assert!(BackendConfig::from_toml(r#"alloc_job_name = "a b""#).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::with_prefix("batchctl").unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "output_dir = \"out\"\nstate_file = \"state.json\"\n").unwrap();
        let config = BackendConfig::load(Some(&path)).unwrap();
        assert!(config.output_dir.is_absolute());
        assert!(config.output_dir.ends_with("out"));
        assert!(config.state_file.unwrap().is_absolute());
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(BackendConfig::load(Some("/nonexistent/batchctl.toml".as_ref())).is_err());
    }

    #[test]
    fn env_overrides() {
        let mut config = BackendConfig::default();
        config.apply_overrides(|key| match key {
            "BATCHCTL_OUTPUT_DIR" => Some("/tmp/logs".to_string()),
            "BATCHCTL_QUERY_TIMEOUT_MS" => Some("1500".to_string()),
            "BATCHCTL_PROBE_TIMEOUT_MS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.output_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(config.query_timeout, Duration::from_millis(1500));
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.immediate_wait, Duration::from_secs(10));
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::common::arraydef::ArrayRange;
use crate::common::error::{BatchError, BatchResult};
use crate::common::size::parse_memory_mb;
use crate::common::timeutils::parse_time_limit;

pub const DEFAULT_JOB_NAME: &str = "batchctl_job";

/// Body of the submitted job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptSource {
    /// Script file, read at submission time.
    Path(PathBuf),
    /// Script content passed directly.
    Inline(String),
}

impl Default for ScriptSource {
    fn default() -> Self {
        ScriptSource::Inline(String::new())
    }
}

impl ScriptSource {
    pub fn load(&self) -> BatchResult<String> {
        match self {
            ScriptSource::Path(path) => std::fs::read_to_string(path).map_err(|error| {
                BatchError::validation(format!(
                    "Cannot read script file {}: {error}",
                    path.display()
                ))
            }),
            ScriptSource::Inline(content) => Ok(content.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub script: ScriptSource,
    pub cores: u32,
    pub memory: Option<String>,
    pub time_limit: String,
    pub job_name: String,
    pub partition: Option<String>,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            script: ScriptSource::default(),
            cores: 1,
            memory: None,
            time_limit: "01:00:00".to_string(),
            job_name: DEFAULT_JOB_NAME.to_string(),
            partition: None,
        }
    }
}

impl JobSpec {
    /// Checks the resource request. Performs no I/O apart from checking that
    /// a script file exists.
    pub fn validate(&self) -> BatchResult<()> {
        if self.cores < 1 {
            return Err(BatchError::validation("Core count must be at least 1"));
        }
        parse_time_limit(&self.time_limit)?;
        if let Some(memory) = &self.memory {
            parse_memory_mb(memory)?;
        }
        validate_token("Job name", &self.job_name)?;
        if let Some(partition) = &self.partition {
            validate_token("Partition", partition)?;
        }
        match &self.script {
            ScriptSource::Path(path) if !path.is_file() => Err(BatchError::validation(format!(
                "Script file {} does not exist",
                path.display()
            ))),
            ScriptSource::Inline(content) if content.trim().is_empty() => {
                Err(BatchError::validation("Script content is empty"))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArraySpec {
    #[serde(flatten)]
    pub job: JobSpec,
    /// Range expression, `<start>-<end>[:<step>]`.
    pub array: String,
    /// Maximum number of simultaneously running tasks.
    pub max_concurrent: Option<u32>,
}

impl ArraySpec {
    /// Validates the spec and returns the parsed array range.
    pub fn validate(&self) -> BatchResult<ArrayRange> {
        self.job.validate()?;
        let range: ArrayRange = self.array.parse().map_err(|error: anyhow::Error| {
            BatchError::validation(format!("Invalid array range `{}`: {error:#}", self.array))
        })?;
        if self.max_concurrent == Some(0) {
            return Err(BatchError::validation(
                "Maximum number of concurrent tasks must be at least 1",
            ));
        }
        Ok(range)
    }
}

/// Names and partitions end up in `#SBATCH` lines and command arguments.
pub(crate) fn validate_token(what: &str, value: &str) -> BatchResult<()> {
    if value.is_empty() {
        return Err(BatchError::validation(format!("{what} must not be empty")));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BatchError::validation(format!(
            "{what} `{value}` must not contain whitespace"
        )));
    }
    Ok(())
}

/// Job ids are passed to Slurm tools as arguments, so they must not look like options.
pub fn validate_job_id(job_id: &str) -> BatchResult<()> {
    if job_id.is_empty() || job_id.starts_with('-') || job_id.chars().any(|c| c.is_whitespace()) {
        return Err(BatchError::validation(format!("Invalid job id `{job_id}`")));
    }
    Ok(())
}

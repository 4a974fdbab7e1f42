use std::path::{Path, PathBuf};

use crate::backend::slurm::parse_sbatch_job_id;
use crate::backend::{Backend, Invocation};
use crate::common::arraydef::ArrayRange;
use crate::common::error::{BatchError, BatchResult};
use crate::jobs::record::{ArrayInfo, JobRecord, JobState};
use crate::jobs::spec::{ArraySpec, JobSpec};

const DEFAULT_SHEBANG: &str = "#!/bin/bash";

/// Array directive of a submission script.
pub struct ArrayDirective {
    pub range: ArrayRange,
    pub max_concurrent: Option<u32>,
}

impl ArrayDirective {
    fn to_sbatch_value(&self) -> String {
        match self.max_concurrent {
            Some(max) => format!("{}%{max}", self.range),
            None => self.range.to_string(),
        }
    }
}

/// Submits batch and array jobs with `sbatch`.
#[derive(Clone)]
pub struct SubmissionManager {
    backend: Backend,
}

impl SubmissionManager {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub async fn submit(&self, spec: &JobSpec) -> BatchResult<JobRecord> {
        spec.validate()?;
        self.backend.ensure_available().await?;

        let (stdout, stderr) = self.output_patterns("slurm_%j");
        let body = spec.script.load()?;
        let script = build_submit_script(spec, &body, &stdout, &stderr, None);
        let job_id = self.submit_script(script).await?;
        log::info!("Job {job_id} ({}) submitted", spec.job_name);

        let mut record = record_from_spec(&job_id, spec);
        record.stdout_path = Some(expand_job_pattern(&stdout, &job_id));
        record.stderr_path = Some(expand_job_pattern(&stderr, &job_id));
        Ok(record)
    }

    /// Submits an array job. The returned record describes the whole array,
    /// individual tasks can be queried through the array job id.
    pub async fn submit_array(&self, spec: &ArraySpec) -> BatchResult<JobRecord> {
        let range = spec.validate()?;
        self.backend.ensure_available().await?;

        let (stdout, stderr) = self.output_patterns("slurm_%A_%a");
        let body = spec.job.script.load()?;
        let directive = ArrayDirective {
            range,
            max_concurrent: spec.max_concurrent,
        };
        let script = build_submit_script(&spec.job, &body, &stdout, &stderr, Some(&directive));
        let job_id = self.submit_script(script).await?;
        log::info!(
            "Array job {job_id} ({}) with {} task(s) submitted",
            spec.job.job_name,
            range.task_count()
        );

        let mut record = record_from_spec(&job_id, &spec.job);
        record.stdout_path = Some(expand_job_pattern(&stdout, &job_id));
        record.stderr_path = Some(expand_job_pattern(&stderr, &job_id));
        record.array = Some(ArrayInfo {
            range,
            tasks: range.task_count(),
            max_concurrent: spec.max_concurrent,
        });
        Ok(record)
    }

    fn output_patterns(&self, stem: &str) -> (PathBuf, PathBuf) {
        let dir = &self.backend.config().output_dir;
        (
            dir.join(format!("{stem}.out")),
            dir.join(format!("{stem}.err")),
        )
    }

    async fn submit_script(&self, script: String) -> BatchResult<String> {
        let output_dir = &self.backend.config().output_dir;
        tokio::fs::create_dir_all(output_dir).await?;

        let program = &self.backend.binaries().sbatch;
        let output = self
            .backend
            .query(Invocation::new(program).with_stdin(script))
            .await?;
        if !output.success() {
            return Err(BatchError::SchedulerRejected {
                command: program.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        parse_sbatch_job_id(&output.stdout).ok_or_else(|| BatchError::ProtocolMismatch {
            command: program.clone(),
            message: "missing job id".to_string(),
            output: output.stdout.trim().to_string(),
        })
    }
}

fn record_from_spec(job_id: &str, spec: &JobSpec) -> JobRecord {
    JobRecord {
        name: Some(spec.job_name.clone()),
        partition: spec.partition.clone(),
        cores: Some(spec.cores),
        memory: spec.memory.clone(),
        time_limit: Some(spec.time_limit.clone()),
        ..JobRecord::new(job_id, JobState::Pending)
    }
}

/// Replaces the job id placeholders (`%j`, `%A`) of an output path.
fn expand_job_pattern(pattern: &Path, job_id: &str) -> PathBuf {
    PathBuf::from(
        pattern
            .to_string_lossy()
            .replace("%j", job_id)
            .replace("%A", job_id),
    )
}

/// Builds the script passed to `sbatch`: resource directives followed by the user's script.
///
/// An interpreter line of the user's script is kept as the first line.
pub fn build_submit_script(
    spec: &JobSpec,
    body: &str,
    stdout: &Path,
    stderr: &Path,
    array: Option<&ArrayDirective>,
) -> String {
    let (shebang, body) = match body.split_once('\n') {
        Some((first, rest)) if first.starts_with("#!") => (first.trim_end(), rest),
        None if body.starts_with("#!") => (body.trim_end(), ""),
        _ => (DEFAULT_SHEBANG, body),
    };

    let mut script = format!(
        r##"{shebang}
#SBATCH --job-name={name}
#SBATCH --cpus-per-task={cores}
#SBATCH --time={time}
#SBATCH --output={stdout}
#SBATCH --error={stderr}
"##,
        name = spec.job_name,
        cores = spec.cores,
        time = spec.time_limit.trim(),
        stdout = stdout.display(),
        stderr = stderr.display(),
    );
    if let Some(memory) = &spec.memory {
        script.push_str(&format!("#SBATCH --mem={}\n", memory.trim()));
    }
    if let Some(partition) = &spec.partition {
        script.push_str(&format!("#SBATCH --partition={partition}\n"));
    }
    if let Some(array) = array {
        script.push_str(&format!("#SBATCH --array={}\n", array.to_sbatch_value()));
    }
    script.push('\n');
    script.push_str(body);
    if !script.ends_with('\n') {
        script.push('\n');
    }
    script
}

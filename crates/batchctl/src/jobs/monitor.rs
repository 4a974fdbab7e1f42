use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bstr::ByteSlice;

use crate::backend::slurm::{
    get_scontrol_items, is_invalid_job_id, non_empty_value, split_fields,
};
use crate::backend::{Backend, Invocation};
use crate::common::error::{BatchError, BatchResult};
use crate::common::fsutils::first_existing_file;
use crate::common::nodelist;
use crate::common::timeutils::parse_slurm_datetime;
use crate::jobs::record::{
    DetailsSource, JobDetails, JobOutput, JobRecord, JobState, OutputStream, QueueSnapshot,
};
use crate::jobs::spec::{validate_job_id, validate_token};

pub const NOT_IN_QUEUE_REASON: &str = "not found in active queue";

/// Job names may contain any character, so the name goes last and keeps the rest of the line.
/// Node lists contain commas, hence the `|` delimiter.
pub(crate) const QUEUE_FORMAT: &str = "--format=%i|%T|%u|%P|%M|%l|%D|%C|%N|%j";
const QUEUE_FIELDS: usize = 10;

const SACCT_DETAILS_FORMAT: &str = "--format=JobID,JobName,Partition,Account,AllocCPUS,State,ExitCode,Start,End,Elapsed,MaxRSS,MaxVMSize";
const SACCT_DETAILS_FIELDS: usize = 12;

/// Read-only queries about jobs. Nothing is cached, every call asks Slurm.
#[derive(Clone)]
pub struct MonitoringService {
    backend: Backend,
}

impl MonitoringService {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Returns the current state of a job.
    ///
    /// Jobs that have left the live queue are looked up in the accounting database.
    /// If that is not possible either, the job is reported as `COMPLETED` with
    /// `inferred` set, because a job that failed early looks the same.
    pub async fn status(&self, job_id: &str) -> BatchResult<JobRecord> {
        validate_job_id(job_id)?;
        self.backend.ensure_available().await?;

        let binaries = self.backend.binaries();
        let output = self
            .backend
            .query(Invocation::new(&binaries.squeue).args([
                "--job",
                job_id,
                "--format=%i,%T,%r",
                "--noheader",
            ]))
            .await?;
        if output.success() {
            if let Some(line) = output.stdout.lines().find(|line| !line.trim().is_empty()) {
                let fields = split_fields(line, ',', 3).ok_or_else(|| {
                    protocol_mismatch(&binaries.squeue, "expected 3 fields", line)
                })?;
                let mut record = JobRecord::new(fields[0], JobState::Unknown)
                    .with_backend_state(fields[1]);
                record.reason = non_empty_value(fields[2]).map(|s| s.to_string());
                return Ok(record);
            }
        } else if !is_invalid_job_id(&output.stderr) {
            return Err(BatchError::SchedulerRejected {
                command: binaries.squeue.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if self.backend.config().use_accounting {
            if let Some(record) = self.accounting_status(job_id).await {
                return Ok(record);
            }
        }
        log::debug!("Job {job_id} is not in the queue, assuming it has completed");
        Ok(JobRecord {
            reason: Some(NOT_IN_QUEUE_REASON.to_string()),
            inferred: true,
            ..JobRecord::new(job_id, JobState::Completed)
        })
    }

    async fn accounting_status(&self, job_id: &str) -> Option<JobRecord> {
        let output = self
            .accounting_lines(job_id, "--format=JobID,State,ExitCode")
            .await?;
        let rows: Vec<Vec<&str>> = output
            .lines()
            .filter_map(|line| split_fields(line, '|', 3))
            .collect();
        let row = select_accounting_row(job_id, &rows, 1)?;
        let mut record = JobRecord::new(job_id, JobState::Unknown).with_backend_state(row[1]);
        record.reason = non_empty_value(row[2])
            .filter(|code| *code != "0:0")
            .map(|code| match row[0] == job_id {
                true => format!("exit code {code}"),
                false => format!("array task {} exit code {code}", row[0]),
            });
        Some(record)
    }

    /// Runs `sacct` for a single job. Any failure is treated as "no information".
    async fn accounting_lines(&self, job_id: &str, format: &str) -> Option<String> {
        let invocation = Invocation::new(&self.backend.binaries().sacct).args([
            "-j",
            job_id,
            format,
            "--parsable2",
            "--noheader",
        ]);
        match self.backend.query(invocation).await {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => {
                Some(output.stdout)
            }
            Ok(output) => {
                log::debug!(
                    "Accounting has no record of job {job_id}: {}",
                    output.stderr.trim()
                );
                None
            }
            Err(error) => {
                log::debug!("Cannot query accounting for job {job_id}: {error}");
                None
            }
        }
    }

    /// Lists jobs in the queue, optionally filtered by user and Slurm state.
    pub async fn list(&self, user: Option<&str>, state: Option<&str>) -> BatchResult<QueueSnapshot> {
        if let Some(user) = user {
            validate_token("User", user)?;
        }
        if let Some(state) = state {
            validate_token("State", state)?;
        }
        self.backend.ensure_available().await?;

        let mut invocation = Invocation::new(&self.backend.binaries().squeue)
            .args([QUEUE_FORMAT, "--noheader"]);
        if let Some(user) = user {
            invocation = invocation.args(["--user", user]);
        }
        if let Some(state) = state {
            let state = state.to_uppercase();
            invocation = invocation.args(["--states", state.as_str()]);
        }
        self.queue_snapshot(invocation).await
    }

    /// Runs a `squeue` invocation that uses [`QUEUE_FORMAT`].
    pub(crate) async fn queue_snapshot(&self, invocation: Invocation) -> BatchResult<QueueSnapshot> {
        let output = self.backend.query_checked(invocation).await?;
        let jobs = parse_queue_lines(&self.backend.binaries().squeue, &output.stdout)?;
        Ok(QueueSnapshot::from_jobs(jobs))
    }

    /// Detailed information about a job, from `scontrol` or from accounting.
    pub async fn details(&self, job_id: &str) -> BatchResult<JobDetails> {
        validate_job_id(job_id)?;
        self.backend.ensure_available().await?;

        let scontrol = &self.backend.binaries().scontrol;
        let output = self
            .backend
            .query(Invocation::new(scontrol).args(["show", "job", job_id]))
            .await?;
        if output.success() {
            let items = get_scontrol_items(&output.stdout);
            if !items.is_empty() {
                return Ok(details_from_scontrol(job_id, &items));
            }
        } else if !is_invalid_job_id(&output.stderr) {
            return Err(BatchError::SchedulerRejected {
                command: scontrol.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if self.backend.config().use_accounting {
            if let Some(lines) = self.accounting_lines(job_id, SACCT_DETAILS_FORMAT).await {
                if let Some(details) = details_from_sacct(job_id, &lines) {
                    return Ok(details);
                }
            }
        }
        Err(BatchError::NotFound(format!("Job {job_id} was not found")))
    }

    /// Reads the stdout or stderr of a job.
    ///
    /// [`BatchError::OutputNotFound`] usually means that the job has not started yet.
    pub async fn output(&self, job_id: &str, stream: OutputStream) -> BatchResult<JobOutput> {
        validate_job_id(job_id)?;
        self.backend.ensure_available().await?;

        let reported = match self.details(job_id).await {
            Ok(details) => match stream {
                OutputStream::Stdout => details.record.stdout_path,
                OutputStream::Stderr => details.record.stderr_path,
            },
            Err(error) => {
                log::debug!("Cannot get details of job {job_id}: {error}");
                None
            }
        };
        let candidates = output_candidates(
            reported,
            &self.backend.config().output_dir,
            job_id,
            stream,
        );
        let path = first_existing_file(candidates.iter().map(|path| path.as_path()))
            .map(|path| path.to_path_buf())
            .ok_or_else(|| BatchError::OutputNotFound {
                job_id: job_id.to_string(),
                candidates: candidates.clone(),
            })?;
        let content = tokio::fs::read(&path).await?;
        Ok(JobOutput {
            job_id: job_id.to_string(),
            stream,
            content: content.to_str_lossy().into_owned(),
            path,
        })
    }
}

fn protocol_mismatch(command: &str, message: &str, output: &str) -> BatchError {
    BatchError::ProtocolMismatch {
        command: command.to_string(),
        message: message.to_string(),
        output: output.to_string(),
    }
}

fn parse_number(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

fn parse_queue_lines(command: &str, stdout: &str) -> BatchResult<Vec<JobRecord>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields = split_fields(line, '|', QUEUE_FIELDS)
                .ok_or_else(|| protocol_mismatch(command, "expected 10 fields", line))?;
            let (node_count, cores) = match (fields[6], fields[7]) {
                ("", "") => (None, None),
                (node_count, cores) => (
                    Some(parse_number(node_count).ok_or_else(|| {
                        protocol_mismatch(command, "invalid node count", line)
                    })?),
                    Some(parse_number(cores).ok_or_else(|| {
                        protocol_mismatch(command, "invalid CPU count", line)
                    })?),
                ),
            };
            Ok(JobRecord {
                user: non_empty_value(fields[2]).map(|s| s.to_string()),
                partition: non_empty_value(fields[3]).map(|s| s.to_string()),
                elapsed: non_empty_value(fields[4]).map(|s| s.to_string()),
                time_limit: non_empty_value(fields[5]).map(|s| s.to_string()),
                node_count,
                cores,
                nodes: nodelist::expand(fields[8]),
                name: non_empty_value(fields[9]).map(|s| s.to_string()),
                ..JobRecord::new(fields[0], JobState::Unknown).with_backend_state(fields[1])
            })
        })
        .collect()
}

/// Value of `mem=` in a TRES string such as `cpu=4,mem=8G,node=1`.
fn tres_memory(tres: &str) -> Option<&str> {
    tres.split(',')
        .find_map(|item| item.strip_prefix("mem="))
}

fn details_from_scontrol(job_id: &str, items: &crate::Map<&str, &str>) -> JobDetails {
    let get = |key: &str| items.get(key).and_then(|value| non_empty_value(value));
    let owned = |key: &str| get(key).map(|value| value.to_string());

    let state = get("JobState").unwrap_or_default();
    let record = JobRecord {
        name: owned("JobName"),
        // `alice(1000)`
        user: get("UserId").map(|user| user.split('(').next().unwrap_or(user).to_string()),
        reason: owned("Reason"),
        partition: owned("Partition"),
        cores: get("NumCPUs").and_then(parse_number),
        memory: get("TRES").and_then(tres_memory).map(|s| s.to_string()),
        node_count: get("NumNodes").and_then(parse_number),
        nodes: get("NodeList").map(nodelist::expand).unwrap_or_default(),
        time_limit: owned("TimeLimit"),
        elapsed: owned("RunTime"),
        stdout_path: get("StdOut").map(PathBuf::from),
        stderr_path: get("StdErr").map(PathBuf::from),
        ..JobRecord::new(get("JobId").unwrap_or(job_id), JobState::Unknown)
            .with_backend_state(state)
    };
    JobDetails {
        record,
        source: DetailsSource::Live,
        account: owned("Account"),
        submit_time: get("SubmitTime").and_then(parse_slurm_datetime),
        start_time: get("StartTime").and_then(parse_slurm_datetime),
        end_time: get("EndTime").and_then(parse_slurm_datetime),
        exit_code: owned("ExitCode"),
        work_dir: get("WorkDir").map(PathBuf::from),
        max_rss: None,
        max_vm_size: None,
        fields: items
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
    }
}

/// Picks the accounting row that describes `job_id`.
///
/// Array jobs have no row of their own, only task rows (`42_0`, `42_[3-5]`, ...).
/// For them the most significant task is chosen: an unfinished one, then a failed one.
fn select_accounting_row<'r, 'a>(
    job_id: &str,
    rows: &'r [Vec<&'a str>],
    state_index: usize,
) -> Option<&'r [&'a str]> {
    if let Some(row) = rows.iter().find(|row| row[0] == job_id) {
        return Some(row.as_slice());
    }
    let task_prefix = format!("{job_id}_");
    rows.iter()
        .filter(|row| row[0].starts_with(&task_prefix) && !row[0].contains('.'))
        .min_by_key(|row| task_rank(JobState::from_slurm(row[state_index])))
        .map(|row| row.as_slice())
}

fn task_rank(state: JobState) -> u8 {
    match state {
        JobState::Running | JobState::Completing | JobState::Suspended => 0,
        JobState::Pending => 1,
        JobState::Failed => 2,
        JobState::Cancelled => 3,
        JobState::Unknown => 4,
        JobState::Completed => 5,
    }
}

fn details_from_sacct(job_id: &str, output: &str) -> Option<JobDetails> {
    let rows: Vec<Vec<&str>> = output
        .lines()
        .filter_map(|line| split_fields(line, '|', SACCT_DETAILS_FIELDS))
        .collect();
    let main = select_accounting_row(job_id, &rows, 5)?;
    let get = |index: usize| non_empty_value(main[index]).map(|value| value.to_string());
    // Memory usage is only reported for job steps (`<id>.batch`, `<id>.0`, ...)
    let step_prefix = format!("{}.", main[0]);
    let step_value = |index: usize| {
        rows.iter()
            .filter(|row| row[0].starts_with(&step_prefix))
            .find_map(|row| non_empty_value(row[index]))
            .map(|value| value.to_string())
    };

    let names = [
        "JobID", "JobName", "Partition", "Account", "AllocCPUS", "State", "ExitCode", "Start",
        "End", "Elapsed", "MaxRSS", "MaxVMSize",
    ];
    let fields: BTreeMap<String, String> = names
        .iter()
        .zip(main.iter())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    let record = JobRecord {
        name: get(1),
        partition: get(2),
        cores: parse_number(main[4]),
        elapsed: get(9),
        ..JobRecord::new(job_id, JobState::Unknown).with_backend_state(main[5])
    };
    Some(JobDetails {
        record,
        source: DetailsSource::Accounting,
        account: get(3),
        submit_time: None,
        start_time: parse_slurm_datetime(main[7]),
        end_time: parse_slurm_datetime(main[8]),
        exit_code: get(6),
        work_dir: None,
        max_rss: get(10).or_else(|| step_value(10)),
        max_vm_size: get(11).or_else(|| step_value(11)),
        fields,
    })
}

/// Paths where the output of a job may be found, in the order of preference.
fn output_candidates(
    reported: Option<PathBuf>,
    output_dir: &Path,
    job_id: &str,
    stream: OutputStream,
) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = reported.into_iter().collect();
    let default = output_dir.join(format!("slurm_{job_id}.{}", stream.extension()));
    if !candidates.contains(&default) {
        candidates.push(default);
    }
    if stream == OutputStream::Stdout {
        // Slurm's own default when no --output was given
        candidates.push(PathBuf::from(format!("slurm-{job_id}.out")));
    }
    candidates
}

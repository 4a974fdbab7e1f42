use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::common::arraydef::ArrayRange;

/// Normalized job state.
///
/// Slurm knows many more states; they are folded into this set by [`JobState::from_slurm`],
/// the original state string is kept in [`JobRecord::backend_state`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Completed,
    Cancelled,
    Failed,
    #[default]
    Unknown,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Pending,
        JobState::Running,
        JobState::Suspended,
        JobState::Completing,
        JobState::Completed,
        JobState::Cancelled,
        JobState::Failed,
        JobState::Unknown,
    ];

    /// Maps a Slurm state (`%T` of squeue, `JobState` of scontrol, `State` of sacct).
    pub fn from_slurm(state: &str) -> JobState {
        // sacct prints e.g. `CANCELLED by 1000`, scontrol may append `+`
        let state = state
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .trim_end_matches('+')
            .to_uppercase();
        match state.as_str() {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD"
            | "RESV_DEL_HOLD" => JobState::Pending,
            "RUNNING" | "RESIZING" | "SIGNALING" | "STAGE_OUT" => JobState::Running,
            "SUSPENDED" | "STOPPED" => JobState::Suspended,
            "COMPLETING" => JobState::Completing,
            "COMPLETED" => JobState::Completed,
            "CANCELLED" | "REVOKED" => JobState::Cancelled,
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" | "BOOT_FAIL"
            | "DEADLINE" | "SPECIAL_EXIT" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Cancelled => "CANCELLED",
            JobState::Failed => "FAILED",
            JobState::Unknown => "UNKNOWN",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Pending | JobState::Running | JobState::Suspended | JobState::Completing
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArrayInfo {
    pub range: ArrayRange,
    pub tasks: u64,
    pub max_concurrent: Option<u32>,
}

/// Snapshot of a job as reported by Slurm (or as submitted).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_state: Option<String>,
    pub reason: Option<String>,
    /// The state was derived from the job's absence rather than reported by Slurm.
    pub inferred: bool,
    pub name: Option<String>,
    pub user: Option<String>,
    pub partition: Option<String>,
    pub cores: Option<u32>,
    pub memory: Option<String>,
    pub node_count: Option<u32>,
    pub nodes: Vec<String>,
    pub time_limit: Option<String>,
    pub elapsed: Option<String>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub array: Option<ArrayInfo>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            ..Default::default()
        }
    }

    pub fn with_backend_state(mut self, backend_state: &str) -> Self {
        self.state = JobState::from_slurm(backend_state);
        self.backend_state = Some(backend_state.to_string());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetailsSource {
    /// `scontrol`, the job is still known to the controller.
    Live,
    /// `sacct`, the job has already left the controller.
    Accounting,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobDetails {
    #[serde(flatten)]
    pub record: JobRecord,
    pub source: DetailsSource,
    pub account: Option<String>,
    pub submit_time: Option<NaiveDateTime>,
    pub start_time: Option<NaiveDateTime>,
    pub end_time: Option<NaiveDateTime>,
    pub exit_code: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub max_rss: Option<String>,
    pub max_vm_size: Option<String>,
    /// All raw fields reported by Slurm.
    pub fields: BTreeMap<String, String>,
}

/// Read-only projection of the queue at the time of the query.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub jobs: Vec<JobRecord>,
    pub counts: BTreeMap<JobState, usize>,
    pub total: usize,
}

impl QueueSnapshot {
    pub fn from_jobs(jobs: Vec<JobRecord>) -> Self {
        let mut counts: BTreeMap<JobState, usize> =
            JobState::ALL.iter().map(|state| (*state, 0)).collect();
        for job in &jobs {
            *counts.entry(job.state).or_default() += 1;
        }
        Self {
            total: jobs.len(),
            jobs,
            counts,
        }
    }

    pub fn empty() -> Self {
        Self::from_jobs(Vec::new())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "out",
            OutputStream::Stderr => "err",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub job_id: String,
    pub stream: OutputStream,
    pub path: PathBuf,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CancellationStatus {
    Cancelled,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CancellationResult {
    pub job_id: String,
    pub status: CancellationStatus,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::{JobRecord, JobState, QueueSnapshot};

    #[test]
    fn map_slurm_states() {
        assert_eq!(JobState::from_slurm("PENDING"), JobState::Pending);
        assert_eq!(JobState::from_slurm("CONFIGURING"), JobState::Pending);
        assert_eq!(JobState::from_slurm("running"), JobState::Running);
        assert_eq!(JobState::from_slurm("CANCELLED by 1000"), JobState::Cancelled);
        assert_eq!(JobState::from_slurm("CANCELLED+"), JobState::Cancelled);
        assert_eq!(JobState::from_slurm("TIMEOUT"), JobState::Failed);
        assert_eq!(JobState::from_slurm("OUT_OF_MEMORY"), JobState::Failed);
        assert_eq!(JobState::from_slurm("STOPPED"), JobState::Suspended);
        assert_eq!(JobState::from_slurm(""), JobState::Unknown);
        assert_eq!(JobState::from_slurm("WEIRD"), JobState::Unknown);
    }

    #[test]
    fn snapshot_counts_every_state() {
        let snapshot = QueueSnapshot::from_jobs(vec![
            JobRecord::new("1", JobState::Running),
            JobRecord::new("2", JobState::Running),
            JobRecord::new("3", JobState::Pending),
        ]);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.counts[&JobState::Running], 2);
        assert_eq!(snapshot.counts[&JobState::Pending], 1);
        assert_eq!(snapshot.counts[&JobState::Failed], 0);
        assert_eq!(snapshot.counts.len(), JobState::ALL.len());
    }

    #[test]
    fn serialize_record() {
        let record = JobRecord::new("42", JobState::Pending);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["job_id"], "42");
        assert_eq!(value["state"], "PENDING");
        assert_eq!(value["inferred"], false);
        assert!(value.get("array").is_none());
    }

    #[test]
    fn serialize_snapshot_counts() {
        let snapshot = QueueSnapshot::from_jobs(vec![JobRecord::new("1", JobState::Completed)]);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["counts"]["COMPLETED"], 1);
        assert_eq!(value["counts"]["PENDING"], 0);
    }
}

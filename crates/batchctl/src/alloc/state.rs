use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Map;
use crate::common::error::{BatchError, BatchResult};
use crate::common::serialization::duration;
use crate::common::size::parse_memory_mb;
use crate::common::timeutils::parse_time_limit;
use crate::jobs::spec::validate_token;

pub type AllocationId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Allocated,
    Timeout,
    Failed,
    Deallocated,
    NotFound,
}

impl AllocationStatus {
    /// Nothing is held in Slurm for a record in a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AllocationStatus::Allocated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Allocated => "allocated",
            AllocationStatus::Timeout => "timeout",
            AllocationStatus::Failed => "failed",
            AllocationStatus::Deallocated => "deallocated",
            AllocationStatus::NotFound => "not_found",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationFailureReason {
    ResourcesUnavailable,
    PolicyViolation,
    SchedulerRejected,
    ProtocolMismatch,
    Cancelled,
    BackendUnavailable,
}

impl AllocationFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationFailureReason::ResourcesUnavailable => "resources_unavailable",
            AllocationFailureReason::PolicyViolation => "policy_violation",
            AllocationFailureReason::SchedulerRejected => "scheduler_rejected",
            AllocationFailureReason::ProtocolMismatch => "protocol_mismatch",
            AllocationFailureReason::Cancelled => "cancelled",
            AllocationFailureReason::BackendUnavailable => "backend_unavailable",
        }
    }

    /// Classifies the error output of a failed `salloc`.
    pub fn from_salloc_error(output: &str) -> Self {
        if output.contains("Immediate allocation impossible")
            || output.contains("Unable to allocate resources")
        {
            AllocationFailureReason::ResourcesUnavailable
        } else if output.contains("violates accounting/QOS policy") {
            AllocationFailureReason::PolicyViolation
        } else {
            AllocationFailureReason::SchedulerRejected
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AllocationRequest {
    pub nodes: u32,
    /// Tasks (cores) per node.
    pub cores: u32,
    pub memory: Option<String>,
    pub time_limit: Option<String>,
    pub partition: Option<String>,
    pub job_name: Option<String>,
    /// Do not share the allocated nodes with other jobs.
    pub exclusive: bool,
    /// Fail right away if the resources are not free.
    pub immediate: bool,
    /// How long to wait for the allocation, ignored for immediate requests.
    #[serde(with = "duration")]
    pub timeout: Duration,
}

impl Default for AllocationRequest {
    fn default() -> Self {
        Self {
            nodes: 1,
            cores: 1,
            memory: None,
            time_limit: None,
            partition: None,
            job_name: None,
            exclusive: true,
            immediate: false,
            timeout: Duration::from_secs(60),
        }
    }
}

impl AllocationRequest {
    pub fn validate(&self) -> BatchResult<()> {
        if self.nodes < 1 {
            return Err(BatchError::validation("Node count must be at least 1"));
        }
        if self.cores < 1 {
            return Err(BatchError::validation("Core count must be at least 1"));
        }
        if let Some(time_limit) = &self.time_limit {
            parse_time_limit(time_limit)?;
        }
        if let Some(memory) = &self.memory {
            parse_memory_mb(memory)?;
        }
        if let Some(partition) = &self.partition {
            validate_token("Partition", partition)?;
        }
        if let Some(name) = &self.job_name {
            validate_token("Job name", name)?;
        }
        if !self.immediate && self.timeout.is_zero() {
            return Err(BatchError::validation(
                "Timeout of a blocking allocation must be larger than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AllocationRecord {
    pub allocation_id: AllocationId,
    pub status: AllocationStatus,
    /// Expanded names of the allocated nodes.
    pub nodes: Vec<String>,
    /// Node list in the compressed Slurm notation.
    pub nodelist: Option<String>,
    pub backend_job_id: Option<String>,
    pub backend_job_name: Option<String>,
    pub backend_state: Option<String>,
    pub time_used: Option<String>,
    /// The record was produced by talking to Slurm.
    pub real_backend: bool,
    /// The status was refreshed from Slurm during this call.
    pub live: bool,
    pub reason: Option<AllocationFailureReason>,
    pub message: Option<String>,
    pub request: Option<AllocationRequest>,
    pub created_at: DateTime<Utc>,
    /// When the record reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl AllocationRecord {
    pub fn new(allocation_id: AllocationId, status: AllocationStatus) -> Self {
        let now = Utc::now();
        Self {
            allocation_id,
            status,
            nodes: Vec::new(),
            nodelist: None,
            backend_job_id: None,
            backend_job_name: None,
            backend_state: None,
            time_used: None,
            real_backend: true,
            live: false,
            reason: None,
            message: None,
            request: None,
            created_at: now,
            finished_at: status.is_terminal().then_some(now),
        }
    }

    pub fn failed(
        allocation_id: AllocationId,
        reason: AllocationFailureReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            reason: Some(reason),
            message: Some(message.into()),
            ..Self::new(allocation_id, AllocationStatus::Failed)
        }
    }

    /// Result for an identifier that is not (or no longer) tracked.
    pub fn not_found(allocation_id: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            real_backend: false,
            ..Self::new(allocation_id.to_string(), AllocationStatus::NotFound)
        }
    }

    /// Failed and timed out attempts are reported as errors to callers.
    pub fn is_error(&self) -> bool {
        matches!(
            self.status,
            AllocationStatus::Failed | AllocationStatus::Timeout
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match (self.status, self.reason) {
            (_, Some(reason)) => reason.as_str(),
            (status, None) => status.as_str(),
        }
    }
}

/// Maps allocation identifiers to the Slurm jobs that hold the allocation.
///
/// Shared by concurrent operations; the lock is never held across an await point.
pub struct AllocationRegistry {
    session: String,
    counter: AtomicU64,
    allocations: Mutex<Map<AllocationId, AllocationRecord>>,
}

impl Default for AllocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self {
            session: format!("{:08x}", rand::random::<u32>()),
            counter: AtomicU64::new(1),
            allocations: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<AllocationId, AllocationRecord>> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a fresh identifier, unique even across registries loaded from the same file.
    pub fn create_id(&self) -> AllocationId {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("alloc-{}-{counter}", self.session)
    }

    pub fn insert(&self, record: AllocationRecord) {
        self.lock().insert(record.allocation_id.clone(), record);
    }

    pub fn get(&self, allocation_id: &str) -> Option<AllocationRecord> {
        self.lock().get(allocation_id).cloned()
    }

    /// Applies `f` to a record and returns its updated copy.
    pub fn update<F: FnOnce(&mut AllocationRecord)>(
        &self,
        allocation_id: &str,
        f: F,
    ) -> Option<AllocationRecord> {
        let mut allocations = self.lock();
        let record = allocations.get_mut(allocation_id)?;
        f(record);
        Some(record.clone())
    }

    /// Marks an allocated record as released.
    ///
    /// Returns `None` if the record is unknown or not in the allocated state, so that
    /// only one of concurrent releases succeeds.
    pub fn take_allocated(&self, allocation_id: &str) -> Option<AllocationRecord> {
        let mut allocations = self.lock();
        let record = allocations.get_mut(allocation_id)?;
        if record.status != AllocationStatus::Allocated {
            return None;
        }
        record.status = AllocationStatus::Deallocated;
        record.finished_at = Some(Utc::now());
        Some(record.clone())
    }

    /// Forgets terminal records that finished more than `retention` ago.
    ///
    /// Returns the number of removed records.
    pub fn prune(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        let mut allocations = self.lock();
        let before = allocations.len();
        allocations.retain(|_, record| {
            !record.status.is_terminal()
                || record.finished_at.unwrap_or(record.created_at) > cutoff
        });
        before - allocations.len()
    }

    /// All records, oldest first.
    pub fn list(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.allocation_id.cmp(&b.allocation_id))
        });
        records
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let registry = Self::new();
        if !path.exists() {
            return Ok(registry);
        }
        let data = std::fs::read(path)
            .with_context(|| format!("Cannot read allocation registry {}", path.display()))?;
        let records: Vec<AllocationRecord> = serde_json::from_slice(&data)
            .with_context(|| format!("Invalid allocation registry {}", path.display()))?;
        {
            let mut allocations = registry.lock();
            for record in records {
                allocations.insert(record.allocation_id.clone(), record);
            }
        }
        Ok(registry)
    }

    /// Writes the registry into a temporary file which then replaces `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&self.list())?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, data)
            .with_context(|| format!("Cannot write allocation registry {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

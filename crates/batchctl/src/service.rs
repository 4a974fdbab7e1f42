//! Uniform result envelopes over all operations.
//!
//! Every operation returns an [`Envelope`] instead of an error, so that a caller
//! (the CLI or any other front-end) can always serialize the outcome as JSON.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::alloc::{AllocationManager, AllocationRecord, AllocationRegistry, AllocationRequest};
use crate::backend::Backend;
use crate::cluster::{ClusterInfo, ClusterInfoService, QueueInfo};
use crate::common::error::{BatchError, BatchResult};
use crate::jobs::{
    ArraySpec, CancellationManager, CancellationResult, JobDetails, JobOutput, JobRecord,
    JobSpec, MonitoringService, OutputStream, QueueSnapshot, SubmissionManager,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    #[serde(rename = "isError")]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorInfo>,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            is_error: false,
            error: None,
            data: Some(data),
        }
    }

    pub fn error(error: &BatchError) -> Self {
        Self {
            is_error: true,
            error: Some(ErrorInfo {
                kind: error.kind().to_string(),
                message: error.to_string(),
            }),
            data: None,
        }
    }

    pub fn from_result(result: BatchResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => {
                log::debug!("Operation failed: {error}");
                Self::error(&error)
            }
        }
    }
}

impl Envelope<AllocationRecord> {
    /// Failed and timed out allocations are flagged as errors but keep their record.
    pub fn from_allocation(result: BatchResult<AllocationRecord>) -> Self {
        match result {
            Ok(record) if record.is_error() => Self {
                is_error: true,
                error: Some(ErrorInfo {
                    kind: record.error_kind().to_string(),
                    message: record
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("Allocation {}", record.status.as_str())),
                }),
                data: Some(record),
            },
            result => Self::from_result(result),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub available: bool,
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AllocationList {
    pub allocations: Vec<AllocationRecord>,
}

/// All operations over a single Slurm backend.
#[derive(Clone)]
pub struct BatchService {
    backend: Backend,
    submission: SubmissionManager,
    monitor: MonitoringService,
    cancellation: CancellationManager,
    allocations: AllocationManager,
    cluster: ClusterInfoService,
}

impl BatchService {
    pub fn new(backend: Backend, registry: Arc<AllocationRegistry>) -> Self {
        Self {
            submission: SubmissionManager::new(backend.clone()),
            monitor: MonitoringService::new(backend.clone()),
            cancellation: CancellationManager::new(backend.clone()),
            allocations: AllocationManager::new(backend.clone(), registry),
            cluster: ClusterInfoService::new(backend.clone()),
            backend,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<AllocationRegistry> {
        self.allocations.registry()
    }

    pub async fn probe(&self) -> Envelope<ProbeResult> {
        let version = self.backend.version().await;
        Envelope::ok(ProbeResult {
            available: version.is_some(),
            version,
        })
    }

    pub async fn submit_job(&self, spec: &JobSpec) -> Envelope<JobRecord> {
        Envelope::from_result(self.submission.submit(spec).await)
    }

    pub async fn submit_array_job(&self, spec: &ArraySpec) -> Envelope<JobRecord> {
        Envelope::from_result(self.submission.submit_array(spec).await)
    }

    pub async fn job_status(&self, job_id: &str) -> Envelope<JobRecord> {
        Envelope::from_result(self.monitor.status(job_id).await)
    }

    pub async fn list_jobs(&self, user: Option<&str>, state: Option<&str>) -> Envelope<QueueSnapshot> {
        Envelope::from_result(self.monitor.list(user, state).await)
    }

    pub async fn job_details(&self, job_id: &str) -> Envelope<JobDetails> {
        Envelope::from_result(self.monitor.details(job_id).await)
    }

    pub async fn job_output(&self, job_id: &str, stream: OutputStream) -> Envelope<JobOutput> {
        Envelope::from_result(self.monitor.output(job_id, stream).await)
    }

    pub async fn cancel_job(&self, job_id: &str) -> Envelope<CancellationResult> {
        Envelope::from_result(self.cancellation.cancel(job_id).await)
    }

    pub async fn allocate_nodes(&self, request: AllocationRequest) -> Envelope<AllocationRecord> {
        self.allocate_nodes_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn allocate_nodes_with_cancel(
        &self,
        request: AllocationRequest,
        token: &CancellationToken,
    ) -> Envelope<AllocationRecord> {
        Envelope::from_allocation(self.allocations.allocate_with_cancel(request, token).await)
    }

    pub async fn deallocate_nodes(&self, allocation_id: &str) -> Envelope<AllocationRecord> {
        Envelope::from_result(self.allocations.deallocate(allocation_id).await)
    }

    pub async fn allocation_status(&self, allocation_id: &str) -> Envelope<AllocationRecord> {
        Envelope::from_result(self.allocations.get_status(allocation_id).await)
    }

    pub fn list_allocations(&self) -> Envelope<AllocationList> {
        Envelope::ok(AllocationList {
            allocations: self.allocations.list(),
        })
    }

    pub async fn cluster_info(&self) -> Envelope<ClusterInfo> {
        Envelope::from_result(self.cluster.cluster_info().await)
    }

    pub async fn queue_info(&self, partition: Option<&str>) -> Envelope<QueueInfo> {
        Envelope::from_result(self.cluster.queue_info(partition).await)
    }
}

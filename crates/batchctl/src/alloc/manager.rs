use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alloc::state::{
    AllocationFailureReason, AllocationRecord, AllocationRegistry, AllocationRequest,
    AllocationStatus,
};
use crate::backend::slurm::{
    is_invalid_job_id, non_empty_value, parse_salloc_job_id, parse_salloc_nodes,
    parse_salloc_pending_id, split_fields,
};
use crate::backend::{Backend, CommandOutput, Invocation};
use crate::common::error::{BatchError, BatchResult};
use crate::common::nodelist;

/// Obtains interactive allocations with `salloc --no-shell` and releases them with `scancel`.
#[derive(Clone)]
pub struct AllocationManager {
    backend: Backend,
    registry: Arc<AllocationRegistry>,
}

enum SallocOutcome {
    Finished(BatchResult<CommandOutput>),
    Cancelled,
}

/// Releases whatever Slurm may have granted to an abandoned allocation request.
///
/// Unless disarmed, the release is performed when the guard is dropped, which covers
/// callers that drop the `allocate` future.
struct CompensationGuard {
    backend: Option<Backend>,
    job_name: String,
}

impl CompensationGuard {
    fn new(backend: Backend, job_name: String) -> Self {
        Self {
            backend: Some(backend),
            job_name,
        }
    }

    fn disarm(&mut self) {
        self.backend = None;
    }

    async fn compensate(&mut self) {
        if let Some(backend) = self.backend.take() {
            release_by_name(backend, self.job_name.clone()).await;
        }
    }
}

impl Drop for CompensationGuard {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(release_by_name(backend, std::mem::take(&mut self.job_name)));
                }
                Err(_) => log::warn!(
                    "Cannot release allocation `{}`: no runtime available",
                    self.job_name
                ),
            }
        }
    }
}

async fn release_by_name(backend: Backend, job_name: String) {
    log::debug!("Releasing any allocation named `{job_name}`");
    let invocation =
        Invocation::new(&backend.binaries().scancel).arg(format!("--name={job_name}"));
    match backend.query(invocation).await {
        Ok(output) if output.success() => {}
        Ok(output) => log::warn!(
            "Cannot release allocation `{job_name}`: {}",
            output.stderr.trim()
        ),
        Err(error) => log::warn!("Cannot release allocation `{job_name}`: {error}"),
    }
}

impl AllocationManager {
    pub fn new(backend: Backend, registry: Arc<AllocationRegistry>) -> Self {
        Self { backend, registry }
    }

    pub fn registry(&self) -> &Arc<AllocationRegistry> {
        &self.registry
    }

    pub async fn allocate(&self, request: AllocationRequest) -> BatchResult<AllocationRecord> {
        self.allocate_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Requests an allocation; cancelling `token` stops the request and releases
    /// anything that Slurm may already have granted.
    pub async fn allocate_with_cancel(
        &self,
        request: AllocationRequest,
        token: &CancellationToken,
    ) -> BatchResult<AllocationRecord> {
        request.validate()?;
        let allocation_id = self.registry.create_id();

        if !self.backend.probe().await {
            let record = AllocationRecord {
                real_backend: false,
                request: Some(request),
                ..AllocationRecord::failed(
                    allocation_id,
                    AllocationFailureReason::BackendUnavailable,
                    BatchError::BackendUnavailable.to_string(),
                )
            };
            self.registry.insert(record.clone());
            return Ok(record);
        }

        let config = self.backend.config();
        let base_name = request
            .job_name
            .as_deref()
            .unwrap_or(&config.alloc_job_name);
        // Unique name, so that a release by name cannot hit unrelated jobs
        let job_name = format!("{base_name}.{allocation_id}");
        let wait = if request.immediate {
            config.immediate_wait
        } else {
            request.timeout
        };
        let invocation = self.salloc_invocation(&request, &job_name).with_timeout(wait);

        log::info!(
            "Requesting allocation {allocation_id} of {} node(s) ({})",
            request.nodes,
            if request.immediate {
                "immediate".to_string()
            } else {
                format!("waiting up to {}", humantime::format_duration(wait))
            }
        );

        let mut guard = CompensationGuard::new(self.backend.clone(), job_name.clone());
        let outcome = tokio::select! {
            result = self.backend.run(invocation) => SallocOutcome::Finished(result),
            _ = token.cancelled() => SallocOutcome::Cancelled,
        };

        let mut record = match outcome {
            SallocOutcome::Finished(Ok(output)) if output.success() => {
                match self.granted_allocation(&allocation_id, &job_name, &output).await {
                    Ok(record) => {
                        guard.disarm();
                        record
                    }
                    Err(record) => {
                        guard.compensate().await;
                        record
                    }
                }
            }
            SallocOutcome::Finished(Ok(output)) => {
                // salloc gave up by itself, nothing was granted
                guard.disarm();
                let text = output.combined();
                let reason = AllocationFailureReason::from_salloc_error(&text);
                log::debug!("Allocation {allocation_id} failed: {}", text.trim());
                AllocationRecord::failed(allocation_id, reason, output.stderr.trim())
            }
            SallocOutcome::Finished(Err(BatchError::Timeout { .. })) => {
                guard.compensate().await;
                let message = format!(
                    "No allocation was granted within {}",
                    humantime::format_duration(wait)
                );
                if request.immediate {
                    AllocationRecord::failed(
                        allocation_id,
                        AllocationFailureReason::ResourcesUnavailable,
                        message,
                    )
                } else {
                    AllocationRecord {
                        message: Some(message),
                        ..AllocationRecord::new(allocation_id, AllocationStatus::Timeout)
                    }
                }
            }
            SallocOutcome::Finished(Err(BatchError::Spawn { program, message })) => {
                guard.disarm();
                AllocationRecord {
                    real_backend: false,
                    ..AllocationRecord::failed(
                        allocation_id,
                        AllocationFailureReason::BackendUnavailable,
                        format!("Cannot start {program}: {message}"),
                    )
                }
            }
            SallocOutcome::Finished(Err(error)) => {
                guard.compensate().await;
                return Err(error);
            }
            SallocOutcome::Cancelled => {
                guard.compensate().await;
                AllocationRecord::failed(
                    allocation_id,
                    AllocationFailureReason::Cancelled,
                    "Allocation request was cancelled",
                )
            }
        };
        record.backend_job_name = Some(job_name);
        record.request = Some(request);
        match record.status {
            AllocationStatus::Allocated => log::info!(
                "Allocation {} granted as job {} on {}",
                record.allocation_id,
                record.backend_job_id.as_deref().unwrap_or("?"),
                record.nodelist.as_deref().unwrap_or("<unknown nodes>")
            ),
            status => log::info!(
                "Allocation {} ended as {}: {}",
                record.allocation_id,
                status.as_str(),
                record.message.as_deref().unwrap_or_default()
            ),
        }
        self.registry.insert(record.clone());
        Ok(record)
    }

    fn salloc_invocation(&self, request: &AllocationRequest, job_name: &str) -> Invocation {
        let config = self.backend.config();
        let mut invocation = Invocation::new(&config.binaries.salloc).args([
            format!("--nodes={}", request.nodes),
            format!("--ntasks-per-node={}", request.cores),
        ]);
        if let Some(memory) = &request.memory {
            invocation = invocation.arg(format!("--mem={memory}"));
        }
        let time_limit = request
            .time_limit
            .as_deref()
            .unwrap_or(&config.default_alloc_time_limit);
        invocation = invocation.arg(format!("--time={time_limit}"));
        if let Some(partition) = &request.partition {
            invocation = invocation.arg(format!("--partition={partition}"));
        }
        if request.exclusive {
            invocation = invocation.arg("--exclusive");
        }
        invocation = invocation.args([format!("--job-name={job_name}"), "--no-shell".to_string()]);
        if request.immediate {
            let seconds = config.immediate_wait.as_secs_f64().ceil().max(1.0) as u64;
            invocation = invocation.arg(format!("--immediate={seconds}"));
        }
        invocation
    }

    /// Builds the record of a successful `salloc`. The job id and the nodes are looked up
    /// in the queue when salloc did not print them.
    async fn granted_allocation(
        &self,
        allocation_id: &str,
        job_name: &str,
        output: &CommandOutput,
    ) -> Result<AllocationRecord, AllocationRecord> {
        let text = output.combined();
        let job_id = match parse_salloc_job_id(&text).or_else(|| parse_salloc_pending_id(&text)) {
            Some(job_id) => Some(job_id),
            None => self.find_job_by_name(job_name).await,
        };
        let Some(job_id) = job_id else {
            return Err(AllocationRecord::failed(
                allocation_id.to_string(),
                AllocationFailureReason::ProtocolMismatch,
                format!("Cannot determine the job id of the allocation:\n{}", text.trim()),
            ));
        };
        let nodelist = match parse_salloc_nodes(&text) {
            Some(nodelist) => Some(nodelist),
            None => self.job_nodelist(&job_id).await,
        };
        Ok(AllocationRecord {
            nodes: nodelist.as_deref().map(nodelist::expand).unwrap_or_default(),
            nodelist,
            backend_job_id: Some(job_id),
            ..AllocationRecord::new(allocation_id.to_string(), AllocationStatus::Allocated)
        })
    }

    async fn first_queue_line(&self, args: &[&str]) -> Option<String> {
        let invocation = Invocation::new(&self.backend.binaries().squeue)
            .args(args.iter().copied())
            .arg("--noheader");
        match self.backend.query(invocation).await {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .map(|line| line.trim())
                .find(|line| !line.is_empty())
                .map(|line| line.to_string()),
            Ok(_) => None,
            Err(error) => {
                log::debug!("Queue lookup failed: {error}");
                None
            }
        }
    }

    async fn find_job_by_name(&self, job_name: &str) -> Option<String> {
        let name = format!("--name={job_name}");
        self.first_queue_line(&[name.as_str(), "--format=%i"]).await
    }

    async fn job_nodelist(&self, job_id: &str) -> Option<String> {
        self.first_queue_line(&["--job", job_id, "--format=%N"])
            .await
            .and_then(|nodes| non_empty_value(&nodes).map(|nodes| nodes.to_string()))
    }

    /// Releases an allocation. Releasing an unknown or already released allocation
    /// yields a `not_found` record, not an error.
    pub async fn deallocate(&self, allocation_id: &str) -> BatchResult<AllocationRecord> {
        let Some(record) = self.registry.get(allocation_id) else {
            return Ok(AllocationRecord::not_found(
                allocation_id,
                format!("Allocation {allocation_id} is not known"),
            ));
        };
        if record.status != AllocationStatus::Allocated {
            return Ok(AllocationRecord::not_found(
                allocation_id,
                format!(
                    "Allocation {allocation_id} is not active (status {})",
                    record.status.as_str()
                ),
            ));
        }
        self.backend.ensure_available().await?;

        let Some(record) = self.registry.take_allocated(allocation_id) else {
            return Ok(AllocationRecord::not_found(
                allocation_id,
                format!("Allocation {allocation_id} was already released"),
            ));
        };
        let Some(job_id) = record.backend_job_id.clone() else {
            return Ok(record);
        };

        let scancel = &self.backend.binaries().scancel;
        let result = self
            .backend
            .query(Invocation::new(scancel).arg(&job_id))
            .await;
        let failure = match result {
            Ok(output) if output.success() || is_invalid_job_id(&output.stderr) => None,
            Ok(output) => Some(BatchError::SchedulerRejected {
                command: scancel.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }),
            Err(error) => Some(error),
        };
        if let Some(error) = failure {
            self.registry.update(allocation_id, |record| {
                record.status = AllocationStatus::Allocated;
                record.finished_at = None;
            });
            return Err(error);
        }
        log::info!("Allocation {allocation_id} (job {job_id}) released");
        Ok(AllocationRecord {
            message: Some(format!("Allocation {allocation_id} released")),
            ..record
        })
    }

    /// Current state of an allocation, refreshed from the queue when Slurm still reports it.
    pub async fn get_status(&self, allocation_id: &str) -> BatchResult<AllocationRecord> {
        let Some(mut record) = self.registry.get(allocation_id) else {
            return Ok(AllocationRecord::not_found(
                allocation_id,
                format!("Allocation {allocation_id} is not known"),
            ));
        };
        record.live = false;
        let job_id = match (&record.backend_job_id, record.status) {
            (Some(job_id), AllocationStatus::Allocated) => job_id.clone(),
            _ => return Ok(record),
        };
        if !self.backend.probe().await {
            record.message = Some("Slurm is not available, showing the last known state".to_string());
            return Ok(record);
        }

        match self
            .first_queue_line(&["--job", job_id.as_str(), "--format=%i,%T,%M,%N"])
            .await
            .and_then(|line| {
                split_fields(&line, ',', 4).map(|fields| {
                    (
                        fields[1].to_string(),
                        fields[2].to_string(),
                        fields[3].to_string(),
                    )
                })
            }) {
            Some((state, time_used, nodelist)) => {
                let updated = self.registry.update(allocation_id, |record| {
                    record.backend_state = Some(state);
                    record.time_used = non_empty_value(&time_used).map(|s| s.to_string());
                    if let Some(nodelist) = non_empty_value(&nodelist) {
                        record.nodes = nodelist::expand(nodelist);
                        record.nodelist = Some(nodelist.to_string());
                    }
                });
                let mut record = updated.unwrap_or(record);
                record.live = true;
                Ok(record)
            }
            None => {
                record.message = Some(
                    "Allocation is no longer reported by Slurm, it may have reached its time limit"
                        .to_string(),
                );
                Ok(record)
            }
        }
    }

    pub fn list(&self) -> Vec<AllocationRecord> {
        self.registry.list()
    }
}

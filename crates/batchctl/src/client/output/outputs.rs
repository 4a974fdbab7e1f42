use crate::alloc::AllocationRecord;
use crate::cluster::{ClusterInfo, QueueInfo};
use crate::jobs::{CancellationResult, JobDetails, JobOutput, JobRecord, QueueSnapshot};
use crate::service::{AllocationList, Envelope, ProbeResult};

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum Outputs {
    CLI,
    JSON,
}

/// Renders the envelope of every command.
///
/// Implementations print the error part of an envelope themselves, so callers
/// only need to look at [`Envelope::is_error`] to pick an exit code.
pub trait Output {
    fn print_probe(&self, probe: &Envelope<ProbeResult>);

    // Jobs
    fn print_job_submitted(&self, job: &Envelope<JobRecord>);
    fn print_job_status(&self, job: &Envelope<JobRecord>);
    fn print_job_list(&self, snapshot: &Envelope<QueueSnapshot>);
    fn print_job_details(&self, details: &Envelope<JobDetails>);
    fn print_job_output(&self, output: &Envelope<JobOutput>);
    fn print_job_cancelled(&self, result: &Envelope<CancellationResult>);

    // Allocations
    fn print_allocation(&self, allocation: &Envelope<AllocationRecord>);
    fn print_allocation_list(&self, allocations: &Envelope<AllocationList>);

    // Cluster
    fn print_cluster_info(&self, info: &Envelope<ClusterInfo>);
    fn print_queue_info(&self, info: &Envelope<QueueInfo>);

    /// Errors that happened before any operation could run (e.g. invalid configuration).
    fn print_error(&self, error: anyhow::Error);
}

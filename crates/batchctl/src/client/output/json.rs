use serde::Serialize;

use crate::alloc::AllocationRecord;
use crate::client::output::outputs::Output;
use crate::cluster::{ClusterInfo, QueueInfo};
use crate::common::error::BatchError;
use crate::jobs::{CancellationResult, JobDetails, JobOutput, JobRecord, QueueSnapshot};
use crate::service::{AllocationList, Envelope, ErrorInfo, ProbeResult};

/// Prints every envelope as a single line of JSON on stdout.
#[derive(Default)]
pub struct JsonOutput;

impl JsonOutput {
    fn print<T: Serialize>(&self, envelope: &Envelope<T>) {
        match serde_json::to_string(envelope) {
            Ok(json) => println!("{json}"),
            Err(error) => log::error!("Cannot serialize output: {error}"),
        }
    }
}

impl Output for JsonOutput {
    fn print_probe(&self, probe: &Envelope<ProbeResult>) {
        self.print(probe);
    }

    fn print_job_submitted(&self, job: &Envelope<JobRecord>) {
        self.print(job);
    }
    fn print_job_status(&self, job: &Envelope<JobRecord>) {
        self.print(job);
    }
    fn print_job_list(&self, snapshot: &Envelope<QueueSnapshot>) {
        self.print(snapshot);
    }
    fn print_job_details(&self, details: &Envelope<JobDetails>) {
        self.print(details);
    }
    fn print_job_output(&self, output: &Envelope<JobOutput>) {
        self.print(output);
    }
    fn print_job_cancelled(&self, result: &Envelope<CancellationResult>) {
        self.print(result);
    }

    fn print_allocation(&self, allocation: &Envelope<AllocationRecord>) {
        self.print(allocation);
    }
    fn print_allocation_list(&self, allocations: &Envelope<AllocationList>) {
        self.print(allocations);
    }

    fn print_cluster_info(&self, info: &Envelope<ClusterInfo>) {
        self.print(info);
    }
    fn print_queue_info(&self, info: &Envelope<QueueInfo>) {
        self.print(info);
    }

    fn print_error(&self, error: anyhow::Error) {
        let kind = match error.downcast_ref::<BatchError>() {
            Some(error) => error.kind(),
            None => "error",
        };
        let envelope: Envelope<()> = Envelope {
            is_error: true,
            error: Some(ErrorInfo {
                kind: kind.to_string(),
                message: format!("{error:#}"),
            }),
            data: None,
        };
        self.print(&envelope);
    }
}

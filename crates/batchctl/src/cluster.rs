use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::backend::slurm::{non_empty_value, split_fields};
use crate::backend::{Backend, Invocation};
use crate::common::error::{BatchError, BatchResult};
use crate::common::nodelist;
use crate::jobs::MonitoringService;
use crate::jobs::monitor::QUEUE_FORMAT;
use crate::jobs::record::{JobRecord, QueueSnapshot};
use crate::jobs::spec::validate_token;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PartitionInfo {
    pub name: String,
    /// The partition is used when a job does not ask for one.
    pub default: bool,
    pub availability: String,
    pub time_limit: String,
    pub node_count: Option<u32>,
    pub state: String,
    pub nodelist: Option<String>,
    pub nodes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CpuSummary {
    pub allocated: u64,
    pub idle: u64,
    pub other: u64,
    pub total: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub state: String,
    pub cpus: CpuSummary,
    pub memory_mb: Option<u64>,
    pub features: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NodeInventory {
    pub total: usize,
    pub states: BTreeMap<String, usize>,
    pub cpus: CpuSummary,
    pub nodes: Vec<NodeInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterInfo {
    pub available: bool,
    pub version: Option<String>,
    pub partitions: Vec<PartitionInfo>,
    pub nodes: NodeInventory,
    pub jobs: Vec<JobRecord>,
}

impl ClusterInfo {
    fn unavailable() -> Self {
        Self {
            available: false,
            version: None,
            partitions: Vec::new(),
            nodes: NodeInventory::default(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueInfo {
    pub available: bool,
    pub partition: Option<String>,
    #[serde(flatten)]
    pub queue: QueueSnapshot,
}

/// Aggregated views of partitions, nodes and the job queue.
#[derive(Clone)]
pub struct ClusterInfoService {
    backend: Backend,
    monitor: MonitoringService,
}

impl ClusterInfoService {
    pub fn new(backend: Backend) -> Self {
        Self {
            monitor: MonitoringService::new(backend.clone()),
            backend,
        }
    }

    /// Partitions, node inventory and jobs of the cluster.
    /// If Slurm is not available, the result is flagged and empty.
    pub async fn cluster_info(&self) -> BatchResult<ClusterInfo> {
        let Some(version) = self.backend.version().await else {
            return Ok(ClusterInfo::unavailable());
        };
        let sinfo = &self.backend.binaries().sinfo;

        let output = self
            .backend
            .query_checked(
                Invocation::new(sinfo).args(["--format=%P,%a,%l,%D,%T,%N", "--noheader"]),
            )
            .await?;
        let partitions = parse_partitions(sinfo, &output.stdout)?;

        let output = self
            .backend
            .query_checked(Invocation::new(sinfo).args([
                "--Node",
                "--format=%N,%T,%C,%m,%f",
                "--noheader",
            ]))
            .await?;
        let nodes = parse_node_inventory(sinfo, &output.stdout)?;

        let queue = self
            .monitor
            .queue_snapshot(
                Invocation::new(&self.backend.binaries().squeue).args([QUEUE_FORMAT, "--noheader"]),
            )
            .await?;

        Ok(ClusterInfo {
            available: true,
            version: Some(version),
            partitions,
            nodes,
            jobs: queue.jobs,
        })
    }

    /// Jobs in the queue with per-state counts, optionally for a single partition.
    pub async fn queue_info(&self, partition: Option<&str>) -> BatchResult<QueueInfo> {
        if let Some(partition) = partition {
            validate_token("Partition", partition)?;
        }
        if !self.backend.probe().await {
            return Ok(QueueInfo {
                available: false,
                partition: partition.map(|p| p.to_string()),
                queue: QueueSnapshot::empty(),
            });
        }
        let mut invocation =
            Invocation::new(&self.backend.binaries().squeue).args([QUEUE_FORMAT, "--noheader"]);
        if let Some(partition) = partition {
            invocation = invocation.args(["--partition", partition]);
        }
        let queue = self.monitor.queue_snapshot(invocation).await?;
        Ok(QueueInfo {
            available: true,
            partition: partition.map(|p| p.to_string()),
            queue,
        })
    }
}

fn mismatch(command: &str, line: &str, fields: usize) -> BatchError {
    BatchError::ProtocolMismatch {
        command: command.to_string(),
        message: format!("expected {fields} fields"),
        output: line.to_string(),
    }
}

fn parse_partitions(command: &str, stdout: &str) -> BatchResult<Vec<PartitionInfo>> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields = split_fields(line, ',', 6).ok_or_else(|| mismatch(command, line, 6))?;
            let nodelist = non_empty_value(fields[5]).map(|s| s.to_string());
            Ok(PartitionInfo {
                name: fields[0].trim_end_matches('*').to_string(),
                default: fields[0].ends_with('*'),
                availability: fields[1].to_string(),
                time_limit: fields[2].to_string(),
                node_count: fields[3].parse().ok(),
                state: fields[4].to_string(),
                nodes: nodelist.as_deref().map(nodelist::expand).unwrap_or_default(),
                nodelist,
            })
        })
        .collect()
}

/// Drops the flags Slurm appends to node states (`idle*`, `mix~`, `drain$`, ...).
fn normalize_node_state(state: &str) -> String {
    state
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_lowercase()
}

fn parse_cpus(value: &str) -> Option<CpuSummary> {
    let parts = value
        .split('/')
        .map(|part| part.trim().parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    match parts.as_slice() {
        [allocated, idle, other, total] => Some(CpuSummary {
            allocated: *allocated,
            idle: *idle,
            other: *other,
            total: *total,
        }),
        _ => None,
    }
}

fn parse_node_inventory(command: &str, stdout: &str) -> BatchResult<NodeInventory> {
    let mut inventory = NodeInventory::default();
    for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
        let fields = split_fields(line, ',', 5).ok_or_else(|| mismatch(command, line, 5))?;
        // A node is printed once for every partition that it belongs to
        if inventory.nodes.iter().any(|node| node.name == fields[0]) {
            continue;
        }
        let cpus = parse_cpus(fields[2]).ok_or_else(|| mismatch(command, line, 5))?;
        let state = normalize_node_state(fields[1]);

        *inventory.states.entry(state.clone()).or_default() += 1;
        inventory.cpus.allocated += cpus.allocated;
        inventory.cpus.idle += cpus.idle;
        inventory.cpus.other += cpus.other;
        inventory.cpus.total += cpus.total;
        inventory.nodes.push(NodeInfo {
            name: fields[0].to_string(),
            state,
            cpus,
            memory_mb: fields[3].trim_end_matches('+').parse().ok(),
            features: non_empty_value(fields[4])
                .map(|features| features.split(',').map(|f| f.to_string()).collect())
                .unwrap_or_default(),
        });
    }
    inventory.total = inventory.nodes.len();
    Ok(inventory)
}

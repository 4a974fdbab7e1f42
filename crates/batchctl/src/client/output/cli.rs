use cli_table::format::{Justify, Separator};
use cli_table::{Cell, CellStruct, Color, ColorChoice, Style, Table, TableStruct, print_stdout};
use colored::Colorize;

use crate::alloc::{AllocationRecord, AllocationStatus};
use crate::client::output::outputs::Output;
use crate::cluster::{ClusterInfo, QueueInfo};
use crate::jobs::{
    CancellationResult, CancellationStatus, JobDetails, JobOutput, JobRecord, JobState,
    QueueSnapshot,
};
use crate::service::{AllocationList, Envelope, ProbeResult};

/// Human readable output with tables.
pub struct CliOutput {
    color_policy: ColorChoice,
}

impl CliOutput {
    pub fn new(color_policy: ColorChoice) -> CliOutput {
        CliOutput { color_policy }
    }

    fn print_vertical_table(&self, rows: Vec<Vec<CellStruct>>) {
        let table = rows.table().separator(
            Separator::builder()
                .column(Some(Default::default()))
                .build(),
        );
        self.print_table(table);
    }

    fn print_horizontal_table(&self, rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
        let table = rows
            .table()
            .separator(
                Separator::builder()
                    .title(Some(Default::default()))
                    .column(Some(Default::default()))
                    .build(),
            )
            .title(header);
        self.print_table(table);
    }

    fn print_table(&self, table: TableStruct) {
        let table = table.color_choice(self.color_policy);
        if let Err(e) = print_stdout(table) {
            log::error!("Cannot print table to stdout: {e:?}");
        }
    }

    /// Prints the error of the envelope (if any) and returns its payload.
    fn unpack<'a, T>(&self, envelope: &'a Envelope<T>) -> Option<&'a T> {
        if let Some(error) = &envelope.error {
            eprintln!("{} {}", "Error:".red().bold(), error.message);
        }
        envelope.data.as_ref()
    }

    fn print_job_table(&self, jobs: &[JobRecord]) {
        let rows: Vec<_> = jobs
            .iter()
            .map(|job| {
                vec![
                    job.job_id.as_str().cell().justify(Justify::Right),
                    optional(&job.name).cell(),
                    job_state_to_cell(job.state),
                    optional(&job.user).cell(),
                    optional(&job.partition).cell(),
                    optional(&job.elapsed).cell(),
                    optional(&job.time_limit).cell(),
                    job.node_count
                        .map(|count| count.to_string())
                        .unwrap_or_default()
                        .cell(),
                    job.nodes.join(",").cell(),
                ]
            })
            .collect();
        let header = vec![
            "Id".cell().bold(true),
            "Name".cell().bold(true),
            "State".cell().bold(true),
            "User".cell().bold(true),
            "Partition".cell().bold(true),
            "Elapsed".cell().bold(true),
            "Time limit".cell().bold(true),
            "Nodes".cell().bold(true),
            "Node list".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    fn print_job_counts(&self, snapshot: &QueueSnapshot) {
        let counts = snapshot
            .counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(state, count)| format!("{state}: {count}"))
            .collect::<Vec<_>>();
        println!("Total jobs: {}", snapshot.total);
        if !counts.is_empty() {
            println!("{}", counts.join(", "));
        }
    }

    fn job_rows(&self, job: &JobRecord) -> Vec<Vec<CellStruct>> {
        let mut rows = vec![
            vec!["Id".cell().bold(true), job.job_id.as_str().cell()],
            vec!["State".cell().bold(true), job_state_to_cell(job.state)],
        ];
        let mut push = |label: &str, value: Option<String>| {
            if let Some(value) = value {
                rows.push(vec![label.cell().bold(true), value.cell()]);
            }
        };
        push("Slurm state", job.backend_state.clone());
        push("Reason", job.reason.clone());
        push("Name", job.name.clone());
        push("User", job.user.clone());
        push("Partition", job.partition.clone());
        push("Cores", job.cores.map(|cores| cores.to_string()));
        push("Memory", job.memory.clone());
        push("Time limit", job.time_limit.clone());
        push("Elapsed", job.elapsed.clone());
        push(
            "Nodes",
            (!job.nodes.is_empty()).then(|| job.nodes.join("\n")),
        );
        push(
            "Stdout",
            job.stdout_path.as_ref().map(|p| p.display().to_string()),
        );
        push(
            "Stderr",
            job.stderr_path.as_ref().map(|p| p.display().to_string()),
        );
        push(
            "Array",
            job.array.as_ref().map(|array| {
                let mut text = format!("{} ({} tasks)", array.range, array.tasks);
                if let Some(limit) = array.max_concurrent {
                    text.push_str(&format!(", at most {limit} at once"));
                }
                text
            }),
        );
        if job.inferred {
            push("Note", Some("State inferred from absence in queue".to_string()));
        }
        rows
    }
}

impl Output for CliOutput {
    fn print_probe(&self, probe: &Envelope<ProbeResult>) {
        if let Some(probe) = self.unpack(probe) {
            match &probe.version {
                Some(version) => println!("Slurm is {} ({version})", "available".green()),
                None => println!("Slurm is {}", "not available".red()),
            }
        }
    }

    fn print_job_submitted(&self, job: &Envelope<JobRecord>) {
        if let Some(job) = self.unpack(job) {
            println!(
                "Job submitted {}, job ID: {}",
                "successfully".color(colored::Color::Green),
                job.job_id
            );
        }
    }

    fn print_job_status(&self, job: &Envelope<JobRecord>) {
        if let Some(job) = self.unpack(job) {
            self.print_vertical_table(self.job_rows(job));
        }
    }

    fn print_job_list(&self, snapshot: &Envelope<QueueSnapshot>) {
        if let Some(snapshot) = self.unpack(snapshot) {
            self.print_job_table(&snapshot.jobs);
            self.print_job_counts(snapshot);
        }
    }

    fn print_job_details(&self, details: &Envelope<JobDetails>) {
        let Some(details) = self.unpack(details) else {
            return;
        };
        let mut rows = self.job_rows(&details.record);
        let times = [
            ("Submitted", details.submit_time),
            ("Started", details.start_time),
            ("Ended", details.end_time),
        ];
        for (label, time) in times {
            if let Some(time) = time {
                rows.push(vec![label.cell().bold(true), time.to_string().cell()]);
            }
        }
        let extra = [
            ("Account", &details.account),
            ("Exit code", &details.exit_code),
            ("Max RSS", &details.max_rss),
            ("Max VM size", &details.max_vm_size),
        ];
        for (label, value) in extra {
            if let Some(value) = value {
                rows.push(vec![label.cell().bold(true), value.as_str().cell()]);
            }
        }
        if let Some(work_dir) = &details.work_dir {
            rows.push(vec![
                "Working directory".cell().bold(true),
                work_dir.display().cell(),
            ]);
        }
        rows.push(vec![
            "Source".cell().bold(true),
            format!("{:?}", details.source).to_lowercase().cell(),
        ]);
        self.print_vertical_table(rows);
    }

    fn print_job_output(&self, output: &Envelope<JobOutput>) {
        if let Some(output) = self.unpack(output) {
            print!("{}", output.content);
        }
    }

    fn print_job_cancelled(&self, result: &Envelope<CancellationResult>) {
        if let Some(result) = self.unpack(result) {
            match result.status {
                CancellationStatus::Cancelled => {
                    println!("Job {} {}", result.job_id, "cancelled".green())
                }
                CancellationStatus::Error => eprintln!(
                    "{} job {}: {}",
                    "Cannot cancel".red(),
                    result.job_id,
                    result.message
                ),
            }
        }
    }

    fn print_allocation(&self, allocation: &Envelope<AllocationRecord>) {
        let Some(allocation) = self.unpack(allocation) else {
            return;
        };
        let mut rows = vec![
            vec![
                "Allocation".cell().bold(true),
                allocation.allocation_id.as_str().cell(),
            ],
            vec![
                "Status".cell().bold(true),
                allocation_status_to_cell(allocation.status),
            ],
        ];
        let fields = [
            ("Slurm job", &allocation.backend_job_id),
            ("Slurm job name", &allocation.backend_job_name),
            ("Slurm state", &allocation.backend_state),
            ("Node list", &allocation.nodelist),
            ("Time used", &allocation.time_used),
            ("Message", &allocation.message),
        ];
        for (label, value) in fields {
            if let Some(value) = value {
                rows.push(vec![label.cell().bold(true), value.as_str().cell()]);
            }
        }
        if !allocation.nodes.is_empty() {
            rows.push(vec![
                "Nodes".cell().bold(true),
                allocation.nodes.join("\n").cell(),
            ]);
        }
        if let Some(reason) = allocation.reason {
            rows.push(vec!["Reason".cell().bold(true), reason.as_str().cell()]);
        }
        rows.push(vec![
            "Created".cell().bold(true),
            allocation.created_at.to_rfc3339().cell(),
        ]);
        self.print_vertical_table(rows);
    }

    fn print_allocation_list(&self, allocations: &Envelope<AllocationList>) {
        let Some(list) = self.unpack(allocations) else {
            return;
        };
        let rows: Vec<_> = list
            .allocations
            .iter()
            .map(|allocation| {
                vec![
                    allocation.allocation_id.as_str().cell(),
                    allocation_status_to_cell(allocation.status),
                    optional(&allocation.backend_job_id).cell(),
                    allocation.nodes.len().cell().justify(Justify::Right),
                    optional(&allocation.nodelist).cell(),
                    allocation.created_at.to_rfc3339().cell(),
                ]
            })
            .collect();
        let header = vec![
            "Id".cell().bold(true),
            "Status".cell().bold(true),
            "Slurm job".cell().bold(true),
            "Nodes".cell().bold(true),
            "Node list".cell().bold(true),
            "Created".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);
    }

    fn print_cluster_info(&self, info: &Envelope<ClusterInfo>) {
        let Some(info) = self.unpack(info) else {
            return;
        };
        if !info.available {
            println!("Slurm is {}", "not available".red());
            return;
        }
        if let Some(version) = &info.version {
            println!("Version: {version}");
        }

        let rows: Vec<_> = info
            .partitions
            .iter()
            .map(|partition| {
                let name = if partition.default {
                    format!("{}*", partition.name)
                } else {
                    partition.name.clone()
                };
                vec![
                    name.cell(),
                    partition.availability.as_str().cell(),
                    partition.time_limit.as_str().cell(),
                    partition
                        .node_count
                        .map(|count| count.to_string())
                        .unwrap_or_default()
                        .cell()
                        .justify(Justify::Right),
                    partition.state.as_str().cell(),
                    optional(&partition.nodelist).cell(),
                ]
            })
            .collect();
        let header = vec![
            "Partition".cell().bold(true),
            "Availability".cell().bold(true),
            "Time limit".cell().bold(true),
            "Nodes".cell().bold(true),
            "State".cell().bold(true),
            "Node list".cell().bold(true),
        ];
        self.print_horizontal_table(rows, header);

        let cpus = &info.nodes.cpus;
        println!(
            "Nodes: {}, CPUs: {} allocated, {} idle, {} other, {} total",
            info.nodes.total, cpus.allocated, cpus.idle, cpus.other, cpus.total
        );
        if !info.nodes.states.is_empty() {
            let states = info
                .nodes
                .states
                .iter()
                .map(|(state, count)| format!("{state}: {count}"))
                .collect::<Vec<_>>();
            println!("Node states: {}", states.join(", "));
        }
        println!("Jobs in queue: {}", info.jobs.len());
    }

    fn print_queue_info(&self, info: &Envelope<QueueInfo>) {
        let Some(info) = self.unpack(info) else {
            return;
        };
        if !info.available {
            println!("Slurm is {}", "not available".red());
            return;
        }
        self.print_job_table(&info.queue.jobs);
        self.print_job_counts(&info.queue);
    }

    fn print_error(&self, error: anyhow::Error) {
        eprintln!("{} {error:?}", "Error:".red().bold());
    }
}

fn optional(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

fn job_state_to_cell(state: JobState) -> CellStruct {
    let color = match state {
        JobState::Pending | JobState::Suspended => Some(Color::Yellow),
        JobState::Running | JobState::Completing => Some(Color::Blue),
        JobState::Completed => Some(Color::Green),
        JobState::Failed => Some(Color::Red),
        JobState::Cancelled => Some(Color::Magenta),
        JobState::Unknown => None,
    };
    state.as_str().cell().foreground_color(color)
}

fn allocation_status_to_cell(status: AllocationStatus) -> CellStruct {
    let color = match status {
        AllocationStatus::Allocated => Color::Green,
        AllocationStatus::Deallocated => Color::Cyan,
        AllocationStatus::NotFound => Color::White,
        AllocationStatus::Failed | AllocationStatus::Timeout => Color::Red,
    };
    status.as_str().cell().foreground_color(Some(color))
}

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};

use crate::client::output::outputs::Outputs;
use crate::jobs::OutputStream;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum ColorPolicy {
    /// Use colors if the stdout is detected to be a terminal.
    Auto,
    /// Always use colors.
    Always,
    /// Never use colors.
    Never,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to a TOML configuration file
    #[arg(
        long,
        value_hint = ValueHint::FilePath,
        global = true,
        env = "BATCHCTL_CONFIG",
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub config: Option<PathBuf>,

    /// Sets console color policy
    #[arg(
        long,
        default_value_t = ColorPolicy::Auto,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub colors: ColorPolicy,

    /// Sets output formatting
    #[arg(
        long,
        env = "BATCHCTL_OUTPUT_MODE",
        default_value_t = Outputs::CLI,
        value_enum,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub output_mode: Outputs,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "BATCHCTL_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::BATCHCTL_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Commands for batch jobs
    Job(JobOpts),
    /// Commands for interactive node allocations
    Alloc(AllocOpts),
    /// Cluster and queue overview
    Cluster(ClusterOpts),
    /// Checks whether Slurm is reachable
    Probe,
}

#[derive(Parser)]
pub struct JobOpts {
    #[clap(subcommand)]
    pub subcmd: JobCommand,
}

#[derive(Parser)]
pub enum JobCommand {
    /// Submit a batch job
    Submit(JobSubmitOpts),
    /// Submit an array job
    Array(JobArrayOpts),
    /// Display the state of a job
    Status(JobIdOpts),
    /// Display jobs in the queue
    List(JobListOpts),
    /// Display detailed information about a job
    Info(JobIdOpts),
    /// Print the stdout or stderr of a job
    Cat(JobCatOpts),
    /// Cancel a job
    Cancel(JobIdOpts),
}

#[derive(Parser)]
pub struct ResourceOpts {
    /// Number of CPU cores per task
    #[arg(long, default_value_t = 1)]
    pub cores: u32,

    /// Memory of the job (e.g. `512M`, `4G`)
    #[arg(long)]
    pub memory: Option<String>,

    /// Time limit in the Slurm format (`[D-]HH:MM:SS`)
    #[arg(long, default_value = "01:00:00")]
    pub time_limit: String,

    /// Name of the job
    #[arg(long)]
    pub name: Option<String>,

    /// Partition where the job should run
    #[arg(long)]
    pub partition: Option<String>,
}

#[derive(Parser)]
pub struct JobSubmitOpts {
    /// Script file that should be submitted
    #[arg(value_hint = ValueHint::FilePath, required_unless_present = "script")]
    pub path: Option<PathBuf>,

    /// Inline script content, used instead of a file
    #[arg(long, conflicts_with = "path")]
    pub script: Option<String>,

    #[clap(flatten)]
    pub resources: ResourceOpts,
}

#[derive(Parser)]
pub struct JobArrayOpts {
    #[clap(flatten)]
    pub submit: JobSubmitOpts,

    /// Array range, e.g. `1-10` or `0-100:2`
    #[arg(long)]
    pub array: String,

    /// Maximum number of array tasks running at once
    #[arg(long)]
    pub max_concurrent: Option<u32>,
}

#[derive(Parser)]
pub struct JobIdOpts {
    /// Slurm job id
    pub job_id: String,
}

#[derive(Parser)]
pub struct JobListOpts {
    /// Display only jobs of the given user
    #[arg(long)]
    pub user: Option<String>,

    /// Display only jobs in the given Slurm state (e.g. `running`)
    #[arg(long)]
    pub state: Option<String>,
}

#[derive(Parser)]
pub struct JobCatOpts {
    /// Slurm job id
    pub job_id: String,

    /// Stream that should be printed
    #[arg(value_enum, default_value_t = OutputStream::Stdout)]
    pub stream: OutputStream,
}

#[derive(Parser)]
pub struct AllocOpts {
    #[clap(subcommand)]
    pub subcmd: AllocCommand,
}

#[derive(Parser)]
pub enum AllocCommand {
    /// Request an allocation of nodes
    Create(AllocCreateOpts),
    /// Release an allocation
    Release(AllocIdOpts),
    /// Display the state of an allocation
    Status(AllocIdOpts),
    /// Display all allocations known to this client
    List,
}

#[derive(Parser)]
pub struct AllocCreateOpts {
    /// Number of nodes
    #[arg(long, default_value_t = 1)]
    pub nodes: u32,

    /// Number of cores (tasks) per node
    #[arg(long, default_value_t = 1)]
    pub cores: u32,

    /// Memory per node (e.g. `4G`)
    #[arg(long)]
    pub memory: Option<String>,

    /// Time limit of the allocation (`[D-]HH:MM:SS`)
    #[arg(long)]
    pub time_limit: Option<String>,

    /// Partition of the allocation
    #[arg(long)]
    pub partition: Option<String>,

    /// Base name of the allocation job
    #[arg(long)]
    pub name: Option<String>,

    /// Allow other jobs to run on the allocated nodes
    #[arg(long)]
    pub shared: bool,

    /// Fail immediately if the resources are not available
    #[arg(long)]
    pub immediate: bool,

    /// How long to wait for the allocation
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

#[derive(Parser)]
pub struct AllocIdOpts {
    /// Allocation id returned by `alloc create`
    pub allocation_id: String,
}

#[derive(Parser)]
pub struct ClusterOpts {
    #[clap(subcommand)]
    pub subcmd: ClusterCommand,
}

#[derive(Parser)]
pub enum ClusterCommand {
    /// Display partitions, nodes and jobs
    Info,
    /// Display the job queue
    Queue(QueueOpts),
}

#[derive(Parser)]
pub struct QueueOpts {
    /// Display only jobs of the given partition
    #[arg(long)]
    pub partition: Option<String>,
}

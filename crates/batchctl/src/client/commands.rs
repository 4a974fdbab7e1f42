use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::alloc::{AllocationRegistry, AllocationRequest};
use crate::backend::Backend;
use crate::client::cli::{
    AllocCreateOpts, AllocIdOpts, JobArrayOpts, JobCatOpts, JobIdOpts, JobListOpts,
    JobSubmitOpts, QueueOpts,
};
use crate::client::globalsettings::GlobalSettings;
use crate::common::fsutils::absolute_path;
use crate::config::BackendConfig;
use crate::jobs::{ArraySpec, JobSpec, ScriptSource};
use crate::jobs::spec::DEFAULT_JOB_NAME;
use crate::service::{BatchService, Envelope};

const REGISTRY_FILE_NAME: &str = "allocations.json";

/// Outcome of a command, decides the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failed,
}

impl CommandStatus {
    pub fn of<T>(envelope: &Envelope<T>) -> Self {
        if envelope.is_error {
            CommandStatus::Failed
        } else {
            CommandStatus::Success
        }
    }
}

/// Where the allocation registry is persisted between CLI invocations.
pub fn registry_path(config: &BackendConfig) -> Option<PathBuf> {
    config.state_file.clone().or_else(|| {
        dirs::data_local_dir().map(|dir| dir.join("batchctl").join(REGISTRY_FILE_NAME))
    })
}

struct Session {
    service: BatchService,
    registry_path: Option<PathBuf>,
    retention: Duration,
}

impl Session {
    fn open(config: &BackendConfig) -> anyhow::Result<Self> {
        let registry_path = registry_path(config);
        let registry = match &registry_path {
            Some(path) => AllocationRegistry::load(path)?,
            None => AllocationRegistry::new(),
        };
        let backend = Backend::local(config.clone());
        Ok(Self {
            service: BatchService::new(backend, Arc::new(registry)),
            registry_path,
            retention: config.registry_retention,
        })
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.registry_path {
            let registry = self.service.registry();
            let pruned = registry.prune(self.retention);
            if pruned > 0 {
                log::debug!("Forgot {pruned} finished allocation(s)");
            }
            registry.save(path)?;
            log::debug!("Allocation registry saved to {}", path.display());
        }
        Ok(())
    }
}

fn job_spec(opts: JobSubmitOpts) -> JobSpec {
    let script = match (opts.path, opts.script) {
        (Some(path), _) => ScriptSource::Path(absolute_path(path)),
        (None, Some(content)) => ScriptSource::Inline(content),
        (None, None) => ScriptSource::default(),
    };
    let resources = opts.resources;
    JobSpec {
        script,
        cores: resources.cores,
        memory: resources.memory,
        time_limit: resources.time_limit,
        job_name: resources.name.unwrap_or_else(|| DEFAULT_JOB_NAME.to_string()),
        partition: resources.partition,
    }
}

pub async fn command_probe(gsettings: &GlobalSettings) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.probe().await;
    gsettings.printer().print_probe(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_submit(
    gsettings: &GlobalSettings,
    opts: JobSubmitOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.submit_job(&job_spec(opts)).await;
    gsettings.printer().print_job_submitted(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_array(
    gsettings: &GlobalSettings,
    opts: JobArrayOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let spec = ArraySpec {
        job: job_spec(opts.submit),
        array: opts.array,
        max_concurrent: opts.max_concurrent,
    };
    let envelope = session.service.submit_array_job(&spec).await;
    gsettings.printer().print_job_submitted(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_status(
    gsettings: &GlobalSettings,
    opts: JobIdOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.job_status(&opts.job_id).await;
    gsettings.printer().print_job_status(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_list(
    gsettings: &GlobalSettings,
    opts: JobListOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session
        .service
        .list_jobs(opts.user.as_deref(), opts.state.as_deref())
        .await;
    gsettings.printer().print_job_list(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_info(
    gsettings: &GlobalSettings,
    opts: JobIdOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.job_details(&opts.job_id).await;
    gsettings.printer().print_job_details(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_cat(
    gsettings: &GlobalSettings,
    opts: JobCatOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.job_output(&opts.job_id, opts.stream).await;
    gsettings.printer().print_job_output(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_job_cancel(
    gsettings: &GlobalSettings,
    opts: JobIdOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.cancel_job(&opts.job_id).await;
    gsettings.printer().print_job_cancelled(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_alloc_create(
    gsettings: &GlobalSettings,
    opts: AllocCreateOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let request = AllocationRequest {
        nodes: opts.nodes,
        cores: opts.cores,
        memory: opts.memory,
        time_limit: opts.time_limit,
        partition: opts.partition,
        job_name: opts.name,
        exclusive: !opts.shared,
        immediate: opts.immediate,
        timeout: opts.timeout,
    };

    // Ctrl-C withdraws the pending request instead of leaving it in the queue.
    let token = CancellationToken::new();
    let interrupt = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Interrupted, withdrawing the allocation request");
                token.cancel();
            }
        })
    };
    let envelope = session
        .service
        .allocate_nodes_with_cancel(request, &token)
        .await;
    interrupt.abort();

    session
        .save()
        .context("Allocation finished, but the registry could not be saved")?;
    gsettings.printer().print_allocation(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_alloc_release(
    gsettings: &GlobalSettings,
    opts: AllocIdOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session
        .service
        .deallocate_nodes(&opts.allocation_id)
        .await;
    session.save()?;
    gsettings.printer().print_allocation(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_alloc_status(
    gsettings: &GlobalSettings,
    opts: AllocIdOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session
        .service
        .allocation_status(&opts.allocation_id)
        .await;
    session.save()?;
    gsettings.printer().print_allocation(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub fn command_alloc_list(gsettings: &GlobalSettings) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.list_allocations();
    gsettings.printer().print_allocation_list(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_cluster_info(gsettings: &GlobalSettings) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.cluster_info().await;
    gsettings.printer().print_cluster_info(&envelope);
    Ok(CommandStatus::of(&envelope))
}

pub async fn command_cluster_queue(
    gsettings: &GlobalSettings,
    opts: QueueOpts,
) -> anyhow::Result<CommandStatus> {
    let session = Session::open(gsettings.config())?;
    let envelope = session.service.queue_info(opts.partition.as_deref()).await;
    gsettings.printer().print_queue_info(&envelope);
    Ok(CommandStatus::of(&envelope))
}

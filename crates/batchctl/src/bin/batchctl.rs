use std::io::IsTerminal;

use clap::{CommandFactory, FromArgMatches};
use cli_table::ColorChoice;

use batchctl::client::cli::{
    AllocCommand, AllocOpts, ClusterCommand, ClusterOpts, ColorPolicy, CommonOpts, JobCommand,
    JobOpts, RootOptions, SubCommand,
};
use batchctl::client::commands::{
    CommandStatus, command_alloc_create, command_alloc_list, command_alloc_release,
    command_alloc_status, command_cluster_info, command_cluster_queue, command_job_array,
    command_job_cancel, command_job_cat, command_job_info, command_job_list, command_job_status,
    command_job_submit, command_probe,
};
use batchctl::client::globalsettings::GlobalSettings;
use batchctl::client::output::cli::CliOutput;
use batchctl::client::output::json::JsonOutput;
use batchctl::client::output::outputs::{Output, Outputs};
use batchctl::common::setup::setup_logging;
use batchctl::config::BackendConfig;

fn make_printer(opts: &CommonOpts) -> Box<dyn Output> {
    let color_policy = match opts.colors {
        ColorPolicy::Always => ColorChoice::AlwaysAnsi,
        ColorPolicy::Auto => {
            if std::io::stdout().is_terminal() {
                ColorChoice::Auto
            } else {
                ColorChoice::Never
            }
        }
        ColorPolicy::Never => ColorChoice::Never,
    };

    match opts.output_mode {
        Outputs::CLI => {
            match color_policy {
                ColorChoice::Always | ColorChoice::AlwaysAnsi => {
                    colored::control::set_override(true)
                }
                ColorChoice::Never => colored::control::set_override(false),
                _ => {}
            }
            Box::new(CliOutput::new(color_policy))
        }
        Outputs::JSON => Box::<JsonOutput>::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let printer = make_printer(&top_opts.common);
    let config = match BackendConfig::load(top_opts.common.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            printer.print_error(error);
            std::process::exit(1);
        }
    };
    let gsettings = GlobalSettings::new(config, printer);

    let result = match top_opts.subcmd {
        SubCommand::Probe => command_probe(&gsettings).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::Submit(opts),
        }) => command_job_submit(&gsettings, opts).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::Array(opts),
        }) => command_job_array(&gsettings, opts).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::Status(opts),
        }) => command_job_status(&gsettings, opts).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::List(opts),
        }) => command_job_list(&gsettings, opts).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::Info(opts),
        }) => command_job_info(&gsettings, opts).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::Cat(opts),
        }) => command_job_cat(&gsettings, opts).await,
        SubCommand::Job(JobOpts {
            subcmd: JobCommand::Cancel(opts),
        }) => command_job_cancel(&gsettings, opts).await,
        SubCommand::Alloc(AllocOpts {
            subcmd: AllocCommand::Create(opts),
        }) => command_alloc_create(&gsettings, opts).await,
        SubCommand::Alloc(AllocOpts {
            subcmd: AllocCommand::Release(opts),
        }) => command_alloc_release(&gsettings, opts).await,
        SubCommand::Alloc(AllocOpts {
            subcmd: AllocCommand::Status(opts),
        }) => command_alloc_status(&gsettings, opts).await,
        SubCommand::Alloc(AllocOpts {
            subcmd: AllocCommand::List,
        }) => command_alloc_list(&gsettings),
        SubCommand::Cluster(ClusterOpts {
            subcmd: ClusterCommand::Info,
        }) => command_cluster_info(&gsettings).await,
        SubCommand::Cluster(ClusterOpts {
            subcmd: ClusterCommand::Queue(opts),
        }) => command_cluster_queue(&gsettings, opts).await,
    };

    match result {
        Ok(CommandStatus::Success) => Ok(()),
        Ok(CommandStatus::Failed) => std::process::exit(1),
        Err(error) => {
            gsettings.printer().print_error(error);
            std::process::exit(1);
        }
    }
}

//! Implementation of the `invocation` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use wdl_slurm::Config;
use wdl_slurm::SlurmApptainerBackend;
use wdl_slurm::TaskExecutionBackend;

use super::TaskArgs;

/// Arguments for the `invocation` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The task to build the invocation for.
    #[command(flatten)]
    pub task: TaskArgs,

    /// The directory where the default wrapper script is written.
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub root_dir: PathBuf,
}

/// Runs the `invocation` subcommand.
///
/// The invocation is printed as a single shell-quoted line.
pub fn invocation(args: Args, config: Config) -> Result<()> {
    let backend = SlurmApptainerBackend::new(config, &args.root_dir)?;
    let runtime = args.task.runtime()?;
    let request = backend.process_runtime(&args.task.job_name, &runtime)?;
    let invocation =
        backend.build_invocation(&request, &args.task.container_task(request.gpu_requested)?)?;
    println!("{invocation}");
    Ok(())
}
